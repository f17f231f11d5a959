//! Test data builders for creating test entities

use chrono::{DateTime, Utc};
use scheduler_core::WorkerConfig;
use scheduler_domain::{
    ExecutionIndexEntry, ExecutionStatus, JobDefinition, JobExecution, Payload, TriggerDefinition,
};

/// Builder for creating test JobDefinition entities
///
/// 缺省类型为 `shell`，集群为 `main`，带一个每天凌晨三点的CRON触发器。
pub struct JobDefinitionBuilder {
    definition: JobDefinition,
}

impl JobDefinitionBuilder {
    pub fn new(code: &str, group: &str) -> Self {
        Self {
            definition: JobDefinition::new(code, group, "shell", "main")
                .with_trigger(TriggerDefinition::cron("0 0 3 * * *").named("nightly")),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.definition.id = id.to_string();
        self
    }

    pub fn with_type(mut self, job_type: &str) -> Self {
        self.definition.job_type = job_type.to_string();
        self
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.definition.cluster = cluster.to_string();
        self
    }

    pub fn without_triggers(mut self) -> Self {
        self.definition.triggers.clear();
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.definition.triggers.push(trigger);
        self
    }

    pub fn with_payload(mut self, key: &str, value: serde_json::Value) -> Self {
        self.definition.payload.insert(key.to_string(), value);
        self
    }

    pub fn silent(mut self) -> Self {
        self.definition.execution_options.silent_iterations = true;
        self
    }

    pub fn modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.definition.modified_at = at;
        self
    }

    pub fn build(self) -> JobDefinition {
        self.definition
    }
}

/// Builder for creating test JobExecution entities
pub struct JobExecutionBuilder {
    execution: JobExecution,
}

impl JobExecutionBuilder {
    pub fn new(id: &str, definition: JobDefinition) -> Self {
        Self {
            execution: JobExecution {
                id: id.to_string(),
                job_id: definition.id.clone(),
                status: ExecutionStatus::Active,
                completion_severity: None,
                payload: Payload::new(),
                cluster: definition.cluster.clone(),
                tenant: definition.tenant.clone(),
                definition,
            },
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.execution.status = status;
        self
    }

    pub fn with_payload(mut self, key: &str, value: serde_json::Value) -> Self {
        self.execution.payload.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> JobExecution {
        self.execution
    }
}

/// 与执行实例对应的索引条目
pub fn index_entry(execution: &JobExecution, status: ExecutionStatus) -> ExecutionIndexEntry {
    ExecutionIndexEntry::new(execution.id.clone(), execution.job_id.clone(), status)
}

/// 间隔与重试延迟都很短的Worker配置，心跳关闭
pub fn fast_worker_config(cluster: &str) -> WorkerConfig {
    let mut config = WorkerConfig::new(cluster);
    config.name = Some("test-worker".to_string());
    config.poll_interval_ms = 50;
    config.heartbeat_interval_ms = 0;
    config.registration_retry_delay_ms = 10;
    config
}
