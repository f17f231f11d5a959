//! 作业定义同步
//!
//! 按固定间隔与控制器交换状态：先退役控制器已不再下发的分组，再对
//! (控制器分组 × 本地作业类型) 逐一交换状态，最后按 删除、新增、更新 的顺序发布变更。
//! 任一通道调用失败都会结束本周期，留到下一个周期重试。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    ControllerChannel, DefinitionUpdate, JobDefinition, JobKey, StatusExchangeRequest,
    StatusExchangeResponse,
};

use crate::publisher::UpdatePublisher;
use crate::schedule_instance::LocalScheduleInstance;

/// 单个同步周期的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub retired_groups: Vec<String>,
    pub exchanges: usize,
    pub removed: usize,
    pub added: usize,
    pub updated: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.retired_groups.is_empty() && self.removed + self.added + self.updated == 0
    }
}

pub struct SyncProtocol {
    cluster: String,
    job_types: Vec<String>,
    channel: Arc<dyn ControllerChannel>,
    instance: Arc<LocalScheduleInstance>,
    publisher: Arc<UpdatePublisher>,
    poll_interval: Duration,
}

impl SyncProtocol {
    pub fn new(
        cluster: impl Into<String>,
        job_types: Vec<String>,
        channel: Arc<dyn ControllerChannel>,
        instance: Arc<LocalScheduleInstance>,
        publisher: Arc<UpdatePublisher>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            job_types,
            channel,
            instance,
            publisher,
            poll_interval,
        }
    }

    pub fn publisher(&self) -> &Arc<UpdatePublisher> {
        &self.publisher
    }

    /// 执行一个同步周期
    pub async fn sync_once(&self) -> SchedulerResult<SyncReport> {
        let mut report = SyncReport::default();
        let metadata = self.channel.metadata(&self.cluster).await?;
        let active: HashSet<&str> = metadata.groups.iter().map(String::as_str).collect();

        for group in self.instance.groups().await {
            if active.contains(group.as_str()) {
                continue;
            }
            let codes = self.instance.codes_in_group(&group).await;
            info!("分组 {} 已不在集群 {} 中，退役 {} 个作业", group, self.cluster, codes.len());
            for code in codes {
                self.publisher
                    .publish(DefinitionUpdate::Remove(JobKey::new(code, group.clone())).into())
                    .await;
                report.removed += 1;
            }
            report.retired_groups.push(group);
        }

        let mut pending = Vec::new();
        for group in &metadata.groups {
            for job_type in &self.job_types {
                let request = StatusExchangeRequest {
                    group: group.clone(),
                    job_type: job_type.clone(),
                    cluster: self.cluster.clone(),
                    state: self.instance.status(group, job_type).await,
                };
                let response = self.channel.status_exchange(&request).await?;
                validate_response(&request, &response)?;
                report.exchanges += 1;
                pending.push((request.group, response));
            }
        }

        for (group, response) in pending {
            self.apply(&group, response, &mut report).await;
        }

        counter!("scheduler_sync_cycles_total", "result" => "ok").increment(1);
        Ok(report)
    }

    async fn apply(&self, group: &str, response: StatusExchangeResponse, report: &mut SyncReport) {
        if response.is_empty() {
            return;
        }

        let mut removed = response.removed;
        removed.sort();
        for code in removed {
            self.publisher
                .publish(DefinitionUpdate::Remove(JobKey::new(code, group)).into())
                .await;
            report.removed += 1;
        }

        for definition in sorted(response.added.into_values()) {
            self.publisher
                .publish(DefinitionUpdate::Add(definition).into())
                .await;
            report.added += 1;
        }

        for definition in sorted(response.updated.into_values()) {
            self.publisher
                .publish(DefinitionUpdate::Update(definition).into())
                .await;
            report.updated += 1;
        }
    }

    /// 启动同步循环，收到关闭信号后退出
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
                        match self.sync_once().await {
                            Ok(report) if report.is_empty() => debug!("作业定义同步完成，无变更"),
                            Ok(report) => info!("作业定义同步完成: {:?}", report),
                            Err(e) => {
                                counter!("scheduler_sync_cycles_total", "result" => "error").increment(1);
                                error!("作业定义同步失败，等待下一个周期: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("作业定义同步任务退出");
                        break;
                    }
                }
            }
        })
    }
}

fn sorted(definitions: impl Iterator<Item = JobDefinition>) -> Vec<JobDefinition> {
    let mut definitions: Vec<_> = definitions.collect();
    definitions.sort_by(|a, b| a.code.cmp(&b.code));
    definitions
}

/// 新增和更新的定义必须属于请求的分组与类型，且与键一致
fn validate_response(
    request: &StatusExchangeRequest,
    response: &StatusExchangeResponse,
) -> SchedulerResult<()> {
    if response.removed.iter().any(|code| code.trim().is_empty()) {
        return Err(SchedulerError::sync(format!(
            "分组 {} 的状态交换返回了空的删除编码",
            request.group
        )));
    }

    for (code, definition) in response.added.iter().chain(response.updated.iter()) {
        if &definition.code != code
            || definition.group != request.group
            || definition.job_type != request.job_type
        {
            return Err(SchedulerError::sync(format!(
                "状态交换返回的定义 {} 与请求 ({}, {}) 不匹配",
                definition.entity_description(),
                request.group,
                request.job_type
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule_instance::{Firing, FiringHandler, FiringTally, ScheduledJob};
    use crate::trigger_engine::TriggerEngine;
    use async_trait::async_trait;
    use scheduler_domain::{ClusterMetadata, IterationStatus, UpdateMessage};
    use scheduler_testing_utils::{builders::JobDefinitionBuilder, MockChannel};
    use tokio::sync::mpsc;

    struct Idle;

    #[async_trait]
    impl FiringHandler for Idle {
        async fn fire(&self, _firing: Firing) -> Option<IterationStatus> {
            None
        }

        async fn exhausted(&self, _job: Arc<ScheduledJob>, _tally: FiringTally) {}
    }

    struct Fixture {
        channel: Arc<MockChannel>,
        instance: Arc<LocalScheduleInstance>,
        protocol: SyncProtocol,
        rx: mpsc::UnboundedReceiver<UpdateMessage>,
    }

    async fn fixture(job_types: &[&str]) -> Fixture {
        let channel = Arc::new(MockChannel::new());
        let instance = Arc::new(LocalScheduleInstance::new(TriggerEngine::new(), Arc::new(Idle)));
        let publisher = Arc::new(UpdatePublisher::new());
        let (tx, rx) = mpsc::unbounded_channel();
        publisher.subscribe(tx).await;
        let protocol = SyncProtocol::new(
            "main",
            job_types.iter().map(|t| t.to_string()).collect(),
            channel.clone(),
            instance.clone(),
            publisher,
            Duration::from_secs(10),
        );
        Fixture {
            channel,
            instance,
            protocol,
            rx,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UpdateMessage>) -> Vec<UpdateMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn metadata(groups: &[&str]) -> ClusterMetadata {
        ClusterMetadata {
            groups: groups.iter().map(|g| g.to_string()).collect(),
            types: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_cycle_exchanges_group_type_cross_product() {
        let mut f = fixture(&["shell", "http"]).await;
        f.channel.set_metadata(metadata(&["finance", "ops"]));

        let report = f.protocol.sync_once().await.unwrap();
        assert_eq!(report.exchanges, 4);
        let mut pairs: Vec<_> = f
            .channel
            .status_requests()
            .into_iter()
            .map(|r| (r.group, r.job_type))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("finance".to_string(), "http".to_string()),
                ("finance".to_string(), "shell".to_string()),
                ("ops".to_string(), "http".to_string()),
                ("ops".to_string(), "shell".to_string()),
            ]
        );
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn test_response_is_published_remove_add_update() {
        let mut f = fixture(&["shell"]).await;
        f.channel.set_metadata(metadata(&["finance"]));
        let existing = JobDefinitionBuilder::new("daily", "finance").build();
        f.instance.schedule(existing.clone()).await;

        let added = JobDefinitionBuilder::new("weekly", "finance").build();
        let mut response = StatusExchangeResponse::default();
        response.removed.push("stale".to_string());
        response.added.insert("weekly".to_string(), added.clone());
        response.updated.insert("daily".to_string(), existing.clone());
        f.channel.push_status_response("finance", "shell", response);

        let report = f.protocol.sync_once().await.unwrap();
        assert_eq!((report.removed, report.added, report.updated), (1, 1, 1));

        let request = &f.channel.status_requests()[0];
        assert!(request.state.contains_key("daily"));

        assert_eq!(
            drain(&mut f.rx),
            vec![
                DefinitionUpdate::Remove(JobKey::new("stale", "finance")).into(),
                DefinitionUpdate::Add(added).into(),
                DefinitionUpdate::Update(existing).into(),
            ]
        );
    }

    #[tokio::test]
    async fn test_absent_group_is_retired() {
        let mut f = fixture(&["shell"]).await;
        f.channel.set_metadata(metadata(&["finance"]));
        f.instance
            .schedule(JobDefinitionBuilder::new("a", "legacy").build())
            .await;
        f.instance
            .schedule(JobDefinitionBuilder::new("b", "legacy").build())
            .await;

        let report = f.protocol.sync_once().await.unwrap();
        assert_eq!(report.retired_groups, vec!["legacy".to_string()]);
        assert_eq!(
            drain(&mut f.rx),
            vec![
                DefinitionUpdate::Remove(JobKey::new("a", "legacy")).into(),
                DefinitionUpdate::Remove(JobKey::new("b", "legacy")).into(),
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_error_aborts_cycle_without_messages() {
        let mut f = fixture(&["shell"]).await;
        f.channel.set_metadata(metadata(&["finance", "ops"]));
        let mut response = StatusExchangeResponse::default();
        response.removed.push("x".to_string());
        f.channel.push_status_response("finance", "shell", response);
        f.channel
            .fail_status_exchange_for("ops", SchedulerError::connection("timeout"));

        assert!(f.protocol.sync_once().await.is_err());
        assert!(drain(&mut f.rx).is_empty());

        f.channel.fail_metadata(SchedulerError::connection("refused"));
        assert!(matches!(
            f.protocol.sync_once().await,
            Err(SchedulerError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_response_is_a_sync_error() {
        let mut f = fixture(&["shell"]).await;
        f.channel.set_metadata(metadata(&["finance"]));
        let foreign = JobDefinitionBuilder::new("weekly", "ops").build();
        let mut response = StatusExchangeResponse::default();
        response.added.insert("weekly".to_string(), foreign);
        f.channel.push_status_response("finance", "shell", response);

        assert!(matches!(
            f.protocol.sync_once().await,
            Err(SchedulerError::Sync(_))
        ));
        assert!(drain(&mut f.rx).is_empty());
    }
}
