use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 集群模式
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// 每个Worker独占一份本地调度
    #[default]
    #[serde(rename = "REPLICA", alias = "replica")]
    Replica,
    /// 多个Worker共享集群级调度，需要外部共享触发器存储提供互斥
    #[serde(rename = "BALANCED", alias = "balanced")]
    Balanced,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Replica => write!(f, "REPLICA"),
            WorkerKind::Balanced => write!(f, "BALANCED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Database,
}

/// 触发器持久化配置，只在 BALANCED 模式下交给外部共享存储使用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            url: None,
            username: None,
            password: None,
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" 或 "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Prometheus 导出地址，例如 "0.0.0.0:9100"；为空时不导出
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub cluster: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub kind: WorkerKind,
    #[serde(default)]
    pub controller_url: Option<String>,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 缺省为30秒，设置为 0 表示关闭心跳
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_registration_tries")]
    pub registration_tries: u32,
    #[serde(default = "default_registration_retry_delay_ms")]
    pub registration_retry_delay_ms: u64,
    #[serde(default = "default_execution_chunk_size")]
    pub execution_chunk_size: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl WorkerConfig {
    pub fn new<S: Into<String>>(cluster: S) -> Self {
        Self {
            cluster: cluster.into(),
            name: None,
            tenant: None,
            kind: WorkerKind::default(),
            controller_url: None,
            persistence: PersistenceConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            parallelism: default_parallelism(),
            registration_tries: default_registration_tries(),
            registration_retry_delay_ms: default_registration_retry_delay_ms(),
            execution_chunk_size: default_execution_chunk_size(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        let mut issues = Vec::new();

        if self.cluster.trim().is_empty() {
            issues.push("集群名称不能为空".to_string());
        }
        if self.poll_interval_ms == 0 {
            issues.push("轮询间隔必须大于0".to_string());
        }
        if self.parallelism == 0 {
            issues.push("执行并行度必须大于0".to_string());
        }
        if self.registration_tries == 0 {
            issues.push("注册重试次数必须大于0".to_string());
        }
        if self.execution_chunk_size == 0 {
            issues.push("执行实例批量大小必须大于0".to_string());
        }
        if self.kind == WorkerKind::Balanced {
            if self.persistence.backend != PersistenceBackend::Database {
                issues.push("BALANCED 模式需要 database 持久化后端".to_string());
            } else if self
                .persistence
                .url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
            {
                issues.push("BALANCED 模式需要配置数据源 url".to_string());
            }
        }
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            issues.push(format!(
                "无效的日志格式: {}，支持的格式: {:?}",
                self.logging.format, valid_formats
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::Configuration(issues.join("; ")))
        }
    }

    /// 配置的Worker名称，未配置时基于主机名生成
    pub fn worker_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let host = hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "localhost".to_string());
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("worker-{host}-{}", &suffix[..8])
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn registration_retry_delay(&self) -> Duration {
        Duration::from_millis(self.registration_retry_delay_ms)
    }
}

fn default_pool_size() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_parallelism() -> usize {
    4
}

fn default_registration_tries() -> u32 {
    3
}

fn default_registration_retry_delay_ms() -> u64 {
    5_000
}

fn default_execution_chunk_size() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::new("main");
        assert_eq!(config.kind, WorkerKind::Replica);
        assert_eq!(config.registration_tries, 3);
        assert_eq!(config.registration_retry_delay(), Duration::from_secs(5));
        assert_eq!(config.execution_chunk_size, 100);
        assert_eq!(config.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_issues() {
        let mut config = WorkerConfig::new(" ");
        config.parallelism = 0;
        config.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("集群名称不能为空"));
        assert!(message.contains("执行并行度必须大于0"));
        assert!(message.contains("轮询间隔必须大于0"));
    }

    #[test]
    fn test_balanced_requires_database() {
        let mut config = WorkerConfig::new("main");
        config.kind = WorkerKind::Balanced;
        assert!(config.validate().is_err());

        config.persistence.backend = PersistenceBackend::Database;
        assert!(config.validate().is_err());

        config.persistence.url = Some("postgres://localhost/triggers".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_name() {
        let mut config = WorkerConfig::new("main");
        config.name = Some("alpha".to_string());
        assert_eq!(config.worker_name(), "alpha");

        config.name = Some("  ".to_string());
        assert!(config.worker_name().starts_with("worker-"));
    }

    #[test]
    fn test_heartbeat_disabled() {
        let mut config = WorkerConfig::new("main");
        config.heartbeat_interval_ms = 0;
        assert_eq!(config.heartbeat_interval(), None);
    }
}
