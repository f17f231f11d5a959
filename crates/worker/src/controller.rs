//! Worker编排
//!
//! 把同步协议与执行索引对账产生的更新消息汇入同一个有序队列，由单个任务依次应用到
//! 本地调度实例；同时负责启动和停止各个周期任务。

use std::any::Any;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, WorkerConfig, WorkerKind};
use scheduler_domain::{
    ControllerChannel, DefinitionUpdate, ExecutionUpdate, UpdateMessage, WorkerActivity,
};

use crate::components::{HeartbeatManager, WorkerLifecycle};
use crate::context::Modules;
use crate::execution_reconciler::ExecutionIndexReconciler;
use crate::executor_registry::{Executor, ExecutorRegistryBuilder};
use crate::publisher::{SubscriptionId, UpdatePublisher};
use crate::runner::{ClusterLock, ExclusiveLock, JobRunner};
use crate::schedule_instance::LocalScheduleInstance;
use crate::sync_protocol::SyncProtocol;
use crate::trigger_engine::TriggerEngine;

pub struct WorkerControllerBuilder {
    config: WorkerConfig,
    channel: Arc<dyn ControllerChannel>,
    executors: ExecutorRegistryBuilder,
    modules: Modules,
    cluster_lock: Option<Arc<dyn ClusterLock>>,
}

impl WorkerControllerBuilder {
    pub fn new(config: WorkerConfig, channel: Arc<dyn ControllerChannel>) -> Self {
        Self {
            config,
            channel,
            executors: ExecutorRegistryBuilder::new(),
            modules: Modules::new(),
            cluster_lock: None,
        }
    }

    pub fn register_executor(mut self, job_type: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors = self.executors.register_executor(job_type, executor);
        self
    }

    pub fn register_factory<F>(mut self, job_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Modules) -> SchedulerResult<Arc<dyn Executor>> + Send + Sync + 'static,
    {
        self.executors = self.executors.register_factory(job_type, factory);
        self
    }

    pub fn module<T: Any + Send + Sync>(mut self, key: impl Into<String>, module: T) -> Self {
        self.modules.insert(key, module);
        self
    }

    /// BALANCED 模式必须提供
    pub fn cluster_lock(mut self, lock: Arc<dyn ClusterLock>) -> Self {
        self.cluster_lock = Some(lock);
        self
    }

    pub fn build(self) -> SchedulerResult<WorkerController> {
        self.config.validate()?;

        let cluster_lock: Arc<dyn ClusterLock> = match (self.config.kind, self.cluster_lock) {
            (_, Some(lock)) => lock,
            (WorkerKind::Replica, None) => Arc::new(ExclusiveLock),
            (WorkerKind::Balanced, None) => {
                return Err(SchedulerError::config_error(
                    "BALANCED 模式需要提供共享触发存储的集群锁",
                ))
            }
        };

        let modules = Arc::new(self.modules);
        let registry = self.executors.build(&modules)?;
        if registry.is_empty() {
            warn!("没有注册任何执行器，Worker不会同步任何作业类型");
        }
        let job_types = registry.job_types();

        let lifecycle = Arc::new(WorkerLifecycle::new(&self.config, Arc::clone(&self.channel)));
        let runner = JobRunner::new(
            registry,
            modules,
            Arc::clone(&self.channel),
            cluster_lock,
            self.config.parallelism,
            lifecycle.session().to_string(),
        );
        let instance = Arc::new(LocalScheduleInstance::new(
            TriggerEngine::new(),
            Arc::new(runner),
        ));

        let sync = Arc::new(SyncProtocol::new(
            self.config.cluster.clone(),
            job_types.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&instance),
            Arc::new(UpdatePublisher::new()),
            self.config.poll_interval(),
        ));
        let reconciler = Arc::new(ExecutionIndexReconciler::new(
            self.config.cluster.clone(),
            Arc::clone(&self.channel),
            Arc::new(UpdatePublisher::new()),
            self.config.execution_chunk_size,
            self.config.poll_interval(),
            Arc::clone(&instance),
        ));
        let heartbeat = self
            .config
            .heartbeat_interval()
            .map(|period| HeartbeatManager::new(Arc::clone(&lifecycle), period));

        Ok(WorkerController {
            config: self.config,
            job_types,
            lifecycle,
            instance,
            sync,
            reconciler,
            heartbeat,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    subscriptions: Vec<(Arc<UpdatePublisher>, SubscriptionId)>,
    consumer: JoinHandle<()>,
    loops: Vec<JoinHandle<()>>,
}

pub struct WorkerController {
    config: WorkerConfig,
    job_types: Vec<String>,
    lifecycle: Arc<WorkerLifecycle>,
    instance: Arc<LocalScheduleInstance>,
    sync: Arc<SyncProtocol>,
    reconciler: Arc<ExecutionIndexReconciler>,
    heartbeat: Option<HeartbeatManager>,
    running: Mutex<Option<Running>>,
}

impl WorkerController {
    pub fn builder(config: WorkerConfig, channel: Arc<dyn ControllerChannel>) -> WorkerControllerBuilder {
        WorkerControllerBuilder::new(config, channel)
    }

    /// 注册、启动调度实例、订阅更新源并启动各周期任务；注册失败是终止性错误
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::Internal(
                "Worker controller already running".to_string(),
            ));
        }

        info!(
            "启动Worker {} (集群: {}, 模式: {}, 作业类型: {:?})",
            self.lifecycle.name(),
            self.config.cluster,
            self.config.kind,
            self.job_types
        );
        self.lifecycle.connect().await?;
        self.instance.start().await;

        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<UpdateMessage>();
        let mut subscriptions = Vec::with_capacity(2);
        for publisher in [self.sync.publisher(), self.reconciler.publisher()] {
            let id = publisher.subscribe(update_tx.clone()).await;
            subscriptions.push((Arc::clone(publisher), id));
        }
        drop(update_tx);

        let instance = Arc::clone(&self.instance);
        let consumer = tokio::spawn(async move {
            while let Some(message) = update_rx.recv().await {
                apply_update(&instance, message).await;
            }
            debug!("更新队列已关闭");
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut loops = vec![
            Arc::clone(&self.sync).start(shutdown_tx.subscribe()),
            Arc::clone(&self.reconciler).start(shutdown_tx.subscribe()),
        ];
        if let Some(heartbeat) = &self.heartbeat {
            loops.push(heartbeat.start_heartbeat_task(shutdown_tx.subscribe()));
        }

        *running = Some(Running {
            shutdown_tx,
            subscriptions,
            consumer,
            loops,
        });
        info!("Worker {} 启动成功", self.lifecycle.name());
        Ok(())
    }

    /// 按启动的相反顺序停止：退订、停止周期任务、停止调度实例，最后上报 SHUTDOWN
    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        info!("停止Worker {}", self.lifecycle.name());

        for (publisher, id) in &running.subscriptions {
            publisher.unsubscribe(*id).await;
        }
        let _ = running.shutdown_tx.send(());
        // 在途的通道调用不强制中断，结果不再被消费
        drop(running.loops);
        if let Err(e) = running.consumer.await {
            warn!("更新队列任务异常结束: {}", e);
        }

        self.instance.shutdown().await;

        if let Err(e) = self.lifecycle.heartbeat(WorkerActivity::Shutdown).await {
            warn!("上报 SHUTDOWN 状态失败: {}", e);
        }
        info!("Worker {} 已停止", self.lifecycle.name());
        Ok(())
    }

    /// 把一条更新消息应用到本地调度实例
    pub async fn received(&self, message: UpdateMessage) {
        apply_update(&self.instance, message).await;
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn job_types(&self) -> &[String] {
        &self.job_types
    }

    pub fn instance(&self) -> &Arc<LocalScheduleInstance> {
        &self.instance
    }

    pub fn lifecycle(&self) -> &Arc<WorkerLifecycle> {
        &self.lifecycle
    }

    pub fn sync_protocol(&self) -> &Arc<SyncProtocol> {
        &self.sync
    }

    pub fn reconciler(&self) -> &Arc<ExecutionIndexReconciler> {
        &self.reconciler
    }
}

async fn apply_update(instance: &LocalScheduleInstance, message: UpdateMessage) {
    debug!("应用更新 {}", message.kind());
    match message {
        UpdateMessage::Definition(DefinitionUpdate::Add(definition)) => {
            instance.schedule(definition).await;
        }
        UpdateMessage::Definition(DefinitionUpdate::Update(definition)) => {
            instance.reschedule(definition).await;
        }
        UpdateMessage::Definition(DefinitionUpdate::Remove(key)) => {
            instance.unschedule(&key.code, &key.group).await;
        }
        UpdateMessage::Execution(ExecutionUpdate::Add(execution)) => {
            instance.schedule_execution(execution).await;
        }
        UpdateMessage::Execution(ExecutionUpdate::Pause(key)) => {
            instance.pause_execution(&key).await;
        }
        UpdateMessage::Execution(ExecutionUpdate::Resume(key)) => {
            instance.resume_execution(&key).await;
        }
        UpdateMessage::Execution(ExecutionUpdate::Delete(key)) => {
            instance.unschedule_execution(&key).await;
        }
    }
}
