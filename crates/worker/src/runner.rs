use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use scheduler_core::SchedulerResult;
use scheduler_domain::{ControllerChannel, Iteration, IterationStatus, JobKey};

use crate::context::{JobContext, Modules};
use crate::executor_registry::ExecutorRegistry;
use crate::schedule_instance::{Firing, FiringHandler, FiringTally, ScheduledJob};

/// 触发前的集群互斥检查
///
/// BALANCED 模式下多个Worker共享同一份逻辑调度，由外部共享存储保证每次触发只执行一次。
#[async_trait]
pub trait ClusterLock: Send + Sync {
    async fn try_acquire(
        &self,
        job: &JobKey,
        trigger_key: &str,
        fire_time: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
}

/// REPLICA 模式：本地调度独占，总是放行
#[derive(Debug, Clone, Copy, Default)]
pub struct ExclusiveLock;

#[async_trait]
impl ClusterLock for ExclusiveLock {
    async fn try_acquire(
        &self,
        _job: &JobKey,
        _trigger_key: &str,
        _fire_time: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        Ok(true)
    }
}

/// 执行到期触发并上报结果
pub struct JobRunner {
    registry: ExecutorRegistry,
    modules: Arc<Modules>,
    channel: Arc<dyn ControllerChannel>,
    lock: Arc<dyn ClusterLock>,
    permits: Arc<Semaphore>,
    session: String,
}

impl JobRunner {
    pub fn new(
        registry: ExecutorRegistry,
        modules: Arc<Modules>,
        channel: Arc<dyn ControllerChannel>,
        lock: Arc<dyn ClusterLock>,
        parallelism: usize,
        session: String,
    ) -> Self {
        Self {
            registry,
            modules,
            channel,
            lock,
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            session,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// 成功时返回收集到的输出，失败时返回错误描述
    async fn execute(&self, firing: &Firing) -> Result<Option<String>, String> {
        let definition = &firing.job.definition;
        let executor = self
            .registry
            .get(&definition.job_type)
            .ok_or_else(|| format!("未注册作业类型 '{}' 的执行器", definition.job_type))?;

        let mut context = JobContext::new(
            definition,
            firing.job.execution.as_ref(),
            firing.trigger_key.clone(),
            firing.fire_time,
            firing.payload.clone(),
            Arc::clone(&self.modules),
        );

        // 独立任务中运行，执行器 panic 只影响本次触发
        let handle = tokio::spawn(async move {
            let result = executor.execute(&mut context).await;
            (result, context.output_ref().to_message())
        });

        match handle.await {
            Ok((Ok(()), output)) => Ok(output),
            Ok((Err(e), output)) => Err(match output {
                Some(output) => format!("{}\n{}", e.message, output),
                None => e.message,
            }),
            Err(join_error) => Err(format!("执行器异常终止: {join_error}")),
        }
    }
}

#[async_trait]
impl FiringHandler for JobRunner {
    async fn fire(&self, firing: Firing) -> Option<IterationStatus> {
        let job_key = firing.job.definition.key();
        match self
            .lock
            .try_acquire(&job_key, &firing.trigger_key, firing.fire_time)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("{} 的触发 {} 由其他Worker执行", job_key, firing.fire_time);
                return None;
            }
            Err(e) => {
                warn!("获取 {} 的集群锁失败，跳过本次触发: {}", job_key, e);
                return None;
            }
        }

        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("执行许可已关闭，跳过 {} 的触发", job_key);
                return None;
            }
        };

        let started = Instant::now();
        let outcome = self.execute(&firing).await;
        let runtime_ms = started.elapsed().as_millis() as u64;

        let (status, message) = match outcome {
            Ok(output) => (IterationStatus::Success, output),
            Err(message) => {
                error!("{} 执行失败: {}", firing.job.describe(), message);
                (IterationStatus::Failure, Some(message))
            }
        };
        let status_label = match status {
            IterationStatus::Success => "success",
            IterationStatus::Failure => "failure",
        };
        counter!("scheduler_firings_total", "status" => status_label).increment(1);

        if status == IterationStatus::Success && firing.job.silent_iterations() {
            debug!("{} 静默模式，不上报成功的迭代", firing.job.describe());
            return Some(status);
        }

        let iteration = Iteration {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: firing.job.definition.id.clone(),
            execution_id: firing.job.execution.as_ref().map(|e| e.id.clone()),
            session: self.session.clone(),
            status,
            message,
            runtime_ms,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.channel.iterate(&iteration).await {
            warn!("上报 {} 的迭代失败: {}", firing.job.describe(), e);
        }

        Some(status)
    }

    async fn exhausted(&self, job: Arc<ScheduledJob>, tally: FiringTally) {
        let Some(execution) = job.execution.as_ref() else {
            return;
        };
        let severity = tally.severity();
        match self.channel.complete(&execution.id, severity).await {
            Ok(_) => info!(
                "执行实例 {} 已完成: {:?} (成功 {}, 失败 {})",
                execution.key(),
                severity,
                tally.successes,
                tally.failures
            ),
            Err(e) => warn!("上报执行实例 {} 完成状态失败: {}", execution.key(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor_registry::Executor;
    use scheduler_core::{JobExecutionError, SchedulerError};
    use scheduler_domain::{CompletionSeverity, ExecutionStatus, JobDefinition, JobExecution, Payload};
    use scheduler_testing_utils::MockChannel;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        async fn execute(&self, context: &mut JobContext) -> Result<(), JobExecutionError> {
            let target = context.payload().require_str("target")?.to_string();
            context.output().write(format!("processed {target}"));
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl Executor for Panics {
        async fn execute(&self, _context: &mut JobContext) -> Result<(), JobExecutionError> {
            panic!("executor bug");
        }
    }

    struct Denied;

    #[async_trait]
    impl ClusterLock for Denied {
        async fn try_acquire(
            &self,
            _job: &JobKey,
            _trigger_key: &str,
            _fire_time: DateTime<Utc>,
        ) -> SchedulerResult<bool> {
            Ok(false)
        }
    }

    fn runner(channel: Arc<MockChannel>, lock: Arc<dyn ClusterLock>) -> JobRunner {
        let registry = ExecutorRegistry::builder()
            .register_executor("echo", Arc::new(Echo))
            .register_executor("panics", Arc::new(Panics))
            .build(&Modules::new())
            .unwrap();
        JobRunner::new(
            registry,
            Arc::new(Modules::new()),
            channel,
            lock,
            2,
            "session-1".to_string(),
        )
    }

    fn firing(job_type: &str, payload: Payload, silent: bool) -> Firing {
        let mut definition = JobDefinition::new("job", "ops", job_type, "main");
        definition.execution_options.silent_iterations = silent;
        Firing {
            job: Arc::new(ScheduledJob {
                definition,
                execution: None,
            }),
            trigger_key: "t".to_string(),
            fire_time: Utc::now(),
            payload,
        }
    }

    fn target_payload() -> Payload {
        let mut payload = Payload::new();
        payload.insert("target".into(), serde_json::json!("orders"));
        payload
    }

    #[tokio::test]
    async fn test_successful_firing_reports_iteration_with_output() {
        let channel = Arc::new(MockChannel::new());
        let runner = runner(Arc::clone(&channel), Arc::new(ExclusiveLock));

        let status = runner.fire(firing("echo", target_payload(), false)).await;
        assert_eq!(status, Some(IterationStatus::Success));

        let iterations = channel.iterations();
        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].session, "session-1");
        assert_eq!(iterations[0].message.as_deref(), Some("processed orders"));
    }

    #[tokio::test]
    async fn test_executor_error_becomes_failure_iteration() {
        let channel = Arc::new(MockChannel::new());
        let runner = runner(Arc::clone(&channel), Arc::new(ExclusiveLock));

        let status = runner.fire(firing("echo", Payload::new(), false)).await;
        assert_eq!(status, Some(IterationStatus::Failure));
        assert_eq!(channel.iterations()[0].status, IterationStatus::Failure);
    }

    #[tokio::test]
    async fn test_panicking_executor_does_not_escape() {
        let channel = Arc::new(MockChannel::new());
        let runner = runner(Arc::clone(&channel), Arc::new(ExclusiveLock));

        let status = runner.fire(firing("panics", Payload::new(), false)).await;
        assert_eq!(status, Some(IterationStatus::Failure));
        assert!(channel.iterations()[0]
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("执行器异常终止"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_failure() {
        let channel = Arc::new(MockChannel::new());
        let runner = runner(Arc::clone(&channel), Arc::new(ExclusiveLock));

        let status = runner.fire(firing("missing", Payload::new(), false)).await;
        assert_eq!(status, Some(IterationStatus::Failure));
    }

    #[tokio::test]
    async fn test_silent_iterations_only_report_failures() {
        let channel = Arc::new(MockChannel::new());
        let runner = runner(Arc::clone(&channel), Arc::new(ExclusiveLock));

        runner.fire(firing("echo", target_payload(), true)).await;
        assert!(channel.iterations().is_empty());

        runner.fire(firing("echo", Payload::new(), true)).await;
        assert_eq!(channel.iterations().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_lock_skips_firing() {
        let channel = Arc::new(MockChannel::new());
        let runner = runner(Arc::clone(&channel), Arc::new(Denied));

        assert_eq!(runner.fire(firing("echo", target_payload(), false)).await, None);
        assert!(channel.iterations().is_empty());
    }

    #[tokio::test]
    async fn test_iterate_failure_is_not_fatal() {
        let channel = Arc::new(MockChannel::new());
        channel.fail_iterate(SchedulerError::connection("down"));
        let runner = runner(Arc::clone(&channel), Arc::new(ExclusiveLock));

        let status = runner.fire(firing("echo", target_payload(), false)).await;
        assert_eq!(status, Some(IterationStatus::Success));
    }

    #[tokio::test]
    async fn test_exhausted_execution_reports_completion() {
        let channel = Arc::new(MockChannel::new());
        let runner = runner(Arc::clone(&channel), Arc::new(ExclusiveLock));
        let definition = JobDefinition::new("job", "ops", "echo", "main");
        let job = Arc::new(ScheduledJob {
            execution: Some(JobExecution {
                id: "e-9".to_string(),
                job_id: definition.id.clone(),
                status: ExecutionStatus::Active,
                completion_severity: None,
                payload: Payload::new(),
                cluster: "main".to_string(),
                tenant: None,
                definition: definition.clone(),
            }),
            definition,
        });

        runner
            .exhausted(
                job,
                FiringTally {
                    successes: 2,
                    failures: 1,
                },
            )
            .await;
        assert_eq!(
            channel.completions(),
            vec![("e-9".to_string(), CompletionSeverity::Warning)]
        );
    }
}
