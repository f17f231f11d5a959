use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, WorkerConfig};
use scheduler_domain::{
    ControllerChannel, HeartbeatRequest, Worker, WorkerActivity, WorkerJoin, WorkerKind,
};

/// Worker注册与心跳
pub struct WorkerLifecycle {
    channel: Arc<dyn ControllerChannel>,
    cluster: String,
    tenant: Option<String>,
    name: String,
    kind: WorkerKind,
    session: String,
    max_idle_ms: u64,
    tries: u32,
    retry_delay: Duration,
    worker: RwLock<Option<Worker>>,
}

impl WorkerLifecycle {
    pub fn new(config: &WorkerConfig, channel: Arc<dyn ControllerChannel>) -> Self {
        Self {
            channel,
            cluster: config.cluster.clone(),
            tenant: config.tenant.clone(),
            name: config.worker_name(),
            kind: config.kind,
            session: uuid::Uuid::new_v4().to_string(),
            max_idle_ms: config.heartbeat_interval_ms,
            tries: config.registration_tries.max(1),
            retry_delay: config.registration_retry_delay(),
            worker: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn join_request(&self) -> WorkerJoin {
        WorkerJoin {
            cluster: self.cluster.clone(),
            tenant: self.tenant.clone(),
            name: self.name.clone(),
            session: self.session.clone(),
            kind: self.kind,
            max_idle_ms: self.max_idle_ms,
        }
    }

    /// 注册到控制器，失败时按固定间隔重试；重试耗尽返回携带最后错误的终止性错误
    pub async fn connect(&self) -> SchedulerResult<Worker> {
        let join = self.join_request();
        let mut last_error = None;

        for attempt in 1..=self.tries {
            match self.channel.registration(&join).await {
                Ok(worker) => {
                    info!(
                        "Worker {} 注册成功 (集群: {}, 模式: {}, 第 {} 次尝试)",
                        worker.name, worker.cluster, worker.kind, attempt
                    );
                    *self.worker.write().await = Some(worker.clone());
                    return Ok(worker);
                }
                Err(e) => {
                    warn!(
                        "Worker {} 第 {}/{} 次注册失败: {}",
                        self.name, attempt, self.tries, e
                    );
                    last_error = Some(e);
                    if attempt < self.tries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(SchedulerError::ConnectionExhausted {
            attempts: self.tries,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// 上报一次活动状态，成功后刷新本地保存的Worker信息
    pub async fn heartbeat(&self, activity: WorkerActivity) -> SchedulerResult<Worker> {
        let worker_id = self
            .worker
            .read()
            .await
            .as_ref()
            .map(|w| w.id.clone())
            .ok_or_else(|| SchedulerError::connection(format!("Worker {} 尚未注册", self.name)))?;

        let worker = self
            .channel
            .heartbeat(&worker_id, &HeartbeatRequest { activity })
            .await?;
        *self.worker.write().await = Some(worker.clone());
        Ok(worker)
    }

    pub async fn worker(&self) -> Option<Worker> {
        self.worker.read().await.clone()
    }

    pub async fn is_registered(&self) -> bool {
        self.worker.read().await.is_some()
    }
}
