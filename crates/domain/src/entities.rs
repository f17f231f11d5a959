use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use scheduler_core::WorkerKind;

/// 任务与触发器携带的业务参数
pub type Payload = HashMap<String, serde_json::Value>;

/// 作业在集群内的唯一标识 (code, group)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub code: String,
    pub group: String,
}

impl JobKey {
    pub fn new<C: Into<String>, G: Into<String>>(code: C, group: G) -> Self {
        Self {
            code: code.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.code)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// 为 true 时只上报失败的迭代
    #[serde(default)]
    pub silent_iterations: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub id: String,
    pub code: String,
    pub group: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub cluster: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
    #[serde(default)]
    pub execution_options: ExecutionOptions,
    #[serde(default)]
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub modified_by: Option<String>,
}

impl JobDefinition {
    pub fn new<C, G, T, K>(code: C, group: G, job_type: T, cluster: K) -> Self
    where
        C: Into<String>,
        G: Into<String>,
        T: Into<String>,
        K: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            group: group.into(),
            job_type: job_type.into(),
            cluster: cluster.into(),
            tenant: None,
            triggers: Vec::new(),
            execution_options: ExecutionOptions::default(),
            payload: Payload::new(),
            created_at: now,
            created_by: None,
            modified_at: now,
            modified_by: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.code.clone(), self.group.clone())
    }

    pub fn with_trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn entity_description(&self) -> String {
        format!(
            "作业 '{}' (分组: {}, 类型: {})",
            self.code, self.group, self.job_type
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    #[serde(rename = "CRON")]
    Cron,
    #[serde(rename = "PERIODIC")]
    Periodic,
    #[serde(rename = "ONE_TIME")]
    OneTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub cron: Option<String>,
    /// 周期，毫秒
    #[serde(default)]
    pub period_ms: Option<i64>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub payload: Payload,
}

impl TriggerDefinition {
    fn bare(trigger_type: TriggerType) -> Self {
        Self {
            name: None,
            trigger_type,
            cron: None,
            period_ms: None,
            start_at: None,
            end_at: None,
            timezone: None,
            payload: Payload::new(),
        }
    }

    pub fn cron<S: Into<String>>(expression: S) -> Self {
        Self {
            cron: Some(expression.into()),
            ..Self::bare(TriggerType::Cron)
        }
    }

    pub fn periodic(period_ms: i64) -> Self {
        Self {
            period_ms: Some(period_ms),
            ..Self::bare(TriggerType::Periodic)
        }
    }

    pub fn one_time(start_at: Option<DateTime<Utc>>) -> Self {
        Self {
            start_at,
            ..Self::bare(TriggerType::OneTime)
        }
    }

    pub fn named<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl ExecutionStatus {
    /// COMPLETED 是终态，不允许再迁移
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        self != ExecutionStatus::Completed || next == ExecutionStatus::Completed
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionSeverity {
    Success,
    Warning,
    Incomplete,
    Fail,
}

/// 执行实例在索引中的标识 (executionId, jobId)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub execution_id: String,
    pub job_id: String,
}

impl ExecutionKey {
    pub fn new<E: Into<String>, J: Into<String>>(execution_id: E, job_id: J) -> Self {
        Self {
            execution_id: execution_id.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.execution_id, self.job_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub completion_severity: Option<CompletionSeverity>,
    #[serde(default)]
    pub payload: Payload,
    pub cluster: String,
    #[serde(default)]
    pub tenant: Option<String>,
    /// 拉取时附带的作业定义快照
    pub definition: JobDefinition,
}

impl JobExecution {
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(self.id.clone(), self.job_id.clone())
    }
}

/// 执行索引中的摘要条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionIndexEntry {
    pub execution_id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
}

impl ExecutionIndexEntry {
    pub fn new<E: Into<String>, J: Into<String>>(
        execution_id: E,
        job_id: J,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            job_id: job_id.into(),
            status,
        }
    }

    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(self.execution_id.clone(), self.job_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationStatus {
    Success,
    Failure,
}

/// 一次触发的结果记录，创建后不可修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    pub id: String,
    pub job_id: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    pub session: String,
    pub status: IterationStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub runtime_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerActivity {
    Register,
    Heartbeat,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub cluster: String,
    pub kind: WorkerKind,
    pub session: String,
    pub last_activity: WorkerActivity,
    pub updated_at: DateTime<Utc>,
}

/// Worker注册请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJoin {
    pub cluster: String,
    #[serde(default)]
    pub tenant: Option<String>,
    pub name: String,
    pub session: String,
    pub kind: WorkerKind,
    pub max_idle_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub activity: WorkerActivity,
}

/// 控制器返回的集群元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusExchangeRequest {
    pub group: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub cluster: String,
    /// code -> 本地已知的最后修改时间
    pub state: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusExchangeResponse {
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub updated: HashMap<String, JobDefinition>,
    #[serde(default)]
    pub added: HashMap<String, JobDefinition>,
}

impl StatusExchangeResponse {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.updated.is_empty() && self.added.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_is_terminal() {
        assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Active));
        assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Paused));
        assert!(ExecutionStatus::Active.can_transition_to(ExecutionStatus::Paused));
        assert!(ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Completed));
    }

    #[test]
    fn test_job_definition_wire_format() {
        let json = serde_json::json!({
            "id": "j-1",
            "code": "nightly-report",
            "group": "reports",
            "type": "shell",
            "cluster": "main",
            "triggers": [
                { "type": "CRON", "cron": "0 0 2 * * *", "payload": { "fast": true } },
                { "name": "every-minute", "type": "PERIODIC", "periodMs": 60000 }
            ],
            "executionOptions": { "silentIterations": true },
            "createdAt": "2024-01-01T00:00:00Z",
            "modifiedAt": "2024-01-02T00:00:00Z"
        });

        let definition: JobDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(definition.key(), JobKey::new("nightly-report", "reports"));
        assert_eq!(definition.triggers.len(), 2);
        assert_eq!(definition.triggers[0].trigger_type, TriggerType::Cron);
        assert_eq!(definition.triggers[1].period_ms, Some(60000));
        assert!(definition.execution_options.silent_iterations);
        assert!(definition.payload.is_empty());
    }

    #[test]
    fn test_status_exchange_response_defaults() {
        let response: StatusExchangeResponse =
            serde_json::from_str(r#"{"removed":["a"]}"#).unwrap();
        assert_eq!(response.removed, vec!["a".to_string()]);
        assert!(response.added.is_empty());
        assert!(!response.is_empty());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(JobKey::new("sync", "billing").to_string(), "billing.sync");
        assert_eq!(ExecutionKey::new("e1", "j1").to_string(), "e1@j1");
    }
}
