//! 执行索引对账
//!
//! 周期性拉取集群的执行索引，与本地调度实例中实际存在的执行实例比较并发布
//! ADD/PAUSE/RESUME/DELETE 消息。分类只产生消息，不直接修改调度状态；
//! 消息尚未应用时下个周期会重新产生同样的消息，应用方对重复消息是幂等的。
//!
//! 分类优先级：
//! 1. 索引状态为 COMPLETED/CANCELLED：本地已知则 DELETE，未知则忽略
//! 2. 本地未知：ADD
//! 3. PAUSED 且本地未暂停：PAUSE
//! 4. ACTIVE 且本地已暂停：RESUME
//!
//! 另外，本地已知但索引中不存在的实例一律 DELETE。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use scheduler_core::SchedulerResult;
use scheduler_domain::{
    ControllerChannel, ExecutionIndexEntry, ExecutionKey, ExecutionStatus, ExecutionUpdate,
    JobExecution,
};

use crate::publisher::UpdatePublisher;
use crate::schedule_instance::LocalScheduleInstance;

/// 对单个执行实例的分类结果
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    Delete(ExecutionKey),
    Pause(ExecutionKey),
    Resume(ExecutionKey),
    Add(ExecutionKey),
}

impl Classification {
    pub fn key(&self) -> &ExecutionKey {
        match self {
            Classification::Delete(key)
            | Classification::Pause(key)
            | Classification::Resume(key)
            | Classification::Add(key) => key,
        }
    }
}

/// 按优先级对索引分类，输出按 DELETE、PAUSE、RESUME、ADD 排序
pub fn classify(
    index: &[ExecutionIndexEntry],
    known: &HashSet<ExecutionKey>,
    paused: &HashSet<ExecutionKey>,
) -> Vec<Classification> {
    // 同一个键出现多次时，终态优先
    let mut latest: HashMap<ExecutionKey, ExecutionStatus> = HashMap::with_capacity(index.len());
    for entry in index {
        latest
            .entry(entry.key())
            .and_modify(|status| {
                if !status.is_terminal() {
                    *status = entry.status;
                }
            })
            .or_insert(entry.status);
    }

    let mut result = Vec::new();
    for (key, status) in &latest {
        let is_known = known.contains(key);
        if status.is_terminal() {
            if is_known {
                result.push(Classification::Delete(key.clone()));
            }
            continue;
        }
        if !is_known {
            result.push(Classification::Add(key.clone()));
            continue;
        }
        let is_paused = paused.contains(key);
        match status {
            ExecutionStatus::Paused if !is_paused => {
                result.push(Classification::Pause(key.clone()))
            }
            ExecutionStatus::Active if is_paused => {
                result.push(Classification::Resume(key.clone()))
            }
            _ => {}
        }
    }

    for key in known {
        if !latest.contains_key(key) {
            result.push(Classification::Delete(key.clone()));
        }
    }

    result.sort();
    result
}

/// 单个对账周期的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub deleted: usize,
    pub paused: usize,
    pub resumed: usize,
    pub added: usize,
    pub failed_chunks: usize,
}

pub struct ExecutionIndexReconciler {
    cluster: String,
    channel: Arc<dyn ControllerChannel>,
    publisher: Arc<UpdatePublisher>,
    chunk_size: usize,
    poll_interval: Duration,
    instance: Arc<LocalScheduleInstance>,
}

impl ExecutionIndexReconciler {
    pub fn new(
        cluster: impl Into<String>,
        channel: Arc<dyn ControllerChannel>,
        publisher: Arc<UpdatePublisher>,
        chunk_size: usize,
        poll_interval: Duration,
        instance: Arc<LocalScheduleInstance>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            channel,
            publisher,
            chunk_size: chunk_size.max(1),
            poll_interval,
            instance,
        }
    }

    pub fn publisher(&self) -> &Arc<UpdatePublisher> {
        &self.publisher
    }

    /// 本地调度实例中已有的执行实例键，已排序
    pub async fn known_keys(&self) -> Vec<ExecutionKey> {
        let mut keys: Vec<_> = self
            .instance
            .execution_snapshot()
            .await
            .known
            .into_iter()
            .collect();
        keys.sort();
        keys
    }

    /// 执行一个对账周期
    pub async fn reconcile_once(&self) -> SchedulerResult<ReconcileReport> {
        let index = self.channel.execution_index(&self.cluster).await?;
        let local = self.instance.execution_snapshot().await;
        let classifications = classify(&index, &local.known, &local.paused);

        let mut report = ReconcileReport::default();
        let mut additions = Vec::new();

        // 先发布 DELETE/PAUSE/RESUME，再开始拉取 ADD
        for classification in classifications {
            let update = match classification {
                Classification::Add(key) => {
                    additions.push(key);
                    continue;
                }
                Classification::Delete(key) => {
                    report.deleted += 1;
                    ExecutionUpdate::Delete(key)
                }
                Classification::Pause(key) => {
                    report.paused += 1;
                    ExecutionUpdate::Pause(key)
                }
                Classification::Resume(key) => {
                    report.resumed += 1;
                    ExecutionUpdate::Resume(key)
                }
            };
            counter!("scheduler_reconciler_messages_total", "kind" => kind(&update)).increment(1);
            self.publisher.publish(update.into()).await;
        }

        if additions.is_empty() {
            return Ok(report);
        }

        let fetches = additions
            .chunks(self.chunk_size)
            .map(|chunk| self.fetch_chunk(chunk.to_vec()));
        for outcome in join_all(fetches).await {
            match outcome {
                Ok(executions) => {
                    for execution in executions {
                        counter!("scheduler_reconciler_messages_total", "kind" => "add")
                            .increment(1);
                        self.publisher
                            .publish(ExecutionUpdate::Add(execution).into())
                            .await;
                        report.added += 1;
                    }
                }
                Err(e) => {
                    report.failed_chunks += 1;
                    warn!("拉取执行实例批次失败，下个周期重试: {}", e);
                }
            }
        }

        Ok(report)
    }

    /// 拉取一个批次，只保留请求过的键
    async fn fetch_chunk(&self, keys: Vec<ExecutionKey>) -> SchedulerResult<Vec<JobExecution>> {
        let ids: Vec<String> = keys.iter().map(|k| k.execution_id.clone()).collect();
        let wanted: HashSet<ExecutionKey> = keys.into_iter().collect();
        let fetched = self.channel.executions(&ids).await?;

        let mut executions = Vec::with_capacity(fetched.len());
        for execution in fetched {
            if wanted.contains(&execution.key()) {
                executions.push(execution);
            } else {
                warn!("控制器返回了未请求的执行实例 {}，已忽略", execution.key());
            }
        }
        if executions.len() < wanted.len() {
            debug!(
                "请求 {} 个执行实例，仅返回 {} 个，缺失的下个周期重试",
                wanted.len(),
                executions.len()
            );
        }
        Ok(executions)
    }

    /// 启动对账循环，收到关闭信号后退出
    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let jitter_ms = rand::rng().random_range(0..=self.poll_interval.as_millis() as u64 / 10);
            let mut ticker = interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
                _ = shutdown_rx.recv() => return,
            }

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.reconcile_once().await {
                            Ok(report) if report == ReconcileReport::default() => {
                                debug!("执行索引对账完成，无变更")
                            }
                            Ok(report) => info!("执行索引对账完成: {:?}", report),
                            Err(e) => error!("执行索引对账失败，等待下一个周期: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("执行索引对账任务退出");
                        break;
                    }
                }
            }
        })
    }
}

fn kind(update: &ExecutionUpdate) -> &'static str {
    match update {
        ExecutionUpdate::Add(_) => "add",
        ExecutionUpdate::Pause(_) => "pause",
        ExecutionUpdate::Resume(_) => "resume",
        ExecutionUpdate::Delete(_) => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ExecutionKey {
        ExecutionKey::new(id, format!("job-{id}"))
    }

    fn entry(id: &str, status: ExecutionStatus) -> ExecutionIndexEntry {
        ExecutionIndexEntry::new(id, format!("job-{id}"), status)
    }

    fn set(ids: &[&str]) -> HashSet<ExecutionKey> {
        ids.iter().map(|id| key(id)).collect()
    }

    #[test]
    fn test_classification_precedence() {
        let index = vec![
            entry("A", ExecutionStatus::Active),
            entry("B", ExecutionStatus::Completed),
            entry("C", ExecutionStatus::Paused),
            entry("D", ExecutionStatus::Active),
        ];
        let result = classify(&index, &set(&["B", "C", "D"]), &set(&["D"]));
        assert_eq!(
            result,
            vec![
                Classification::Delete(key("B")),
                Classification::Pause(key("C")),
                Classification::Resume(key("D")),
                Classification::Add(key("A")),
            ]
        );
    }

    #[test]
    fn test_completed_overrides_local_pause() {
        let index = vec![entry("B", ExecutionStatus::Completed)];
        let result = classify(&index, &set(&["B"]), &set(&["B"]));
        assert_eq!(result, vec![Classification::Delete(key("B"))]);
    }

    #[test]
    fn test_empty_index_deletes_every_local_execution() {
        let result = classify(&[], &set(&["X", "Y"]), &set(&["Y"]));
        assert_eq!(
            result,
            vec![
                Classification::Delete(key("X")),
                Classification::Delete(key("Y")),
            ]
        );
    }

    #[test]
    fn test_unknown_terminal_entries_are_ignored() {
        let index = vec![
            entry("E", ExecutionStatus::Completed),
            entry("F", ExecutionStatus::Cancelled),
        ];
        assert!(classify(&index, &HashSet::new(), &HashSet::new()).is_empty());
    }

    #[test]
    fn test_steady_state_yields_nothing() {
        let index = vec![
            entry("A", ExecutionStatus::Active),
            entry("P", ExecutionStatus::Paused),
        ];
        assert!(classify(&index, &set(&["A", "P"]), &set(&["P"])).is_empty());
    }

    #[test]
    fn test_duplicate_entries_prefer_terminal_status() {
        let index = vec![
            entry("A", ExecutionStatus::Completed),
            entry("A", ExecutionStatus::Active),
        ];
        assert_eq!(
            classify(&index, &set(&["A"]), &HashSet::new()),
            vec![Classification::Delete(key("A"))]
        );
    }

    #[test]
    fn test_same_execution_id_under_different_jobs_are_distinct() {
        let index = vec![
            ExecutionIndexEntry::new("e1", "job-a", ExecutionStatus::Active),
            ExecutionIndexEntry::new("e1", "job-b", ExecutionStatus::Active),
        ];
        let known: HashSet<_> = [ExecutionKey::new("e1", "job-a")].into_iter().collect();
        assert_eq!(
            classify(&index, &known, &HashSet::new()),
            vec![Classification::Add(ExecutionKey::new("e1", "job-b"))]
        );
    }
}
