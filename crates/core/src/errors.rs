use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("连接错误: {0}")]
    Connection(String),

    #[error("连接重试已耗尽: 共尝试 {attempts} 次, 最后错误: {last}")]
    ConnectionExhausted { attempts: u32, last: String },

    #[error("数据错误: {}", .issues.join("; "))]
    Data { issues: Vec<String> },

    #[error("同步错误: {0}")]
    Sync(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的触发器: {0}")]
    InvalidTrigger(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    pub fn sync<S: Into<String>>(msg: S) -> Self {
        Self::Sync(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 把多条数据层问题合并成一个错误
    pub fn data<I, S>(issues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Data {
            issues: issues.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::ConnectionExhausted { .. }
                | SchedulerError::Configuration(_)
                | SchedulerError::Internal(_)
        )
    }

    /// 只有通道层面的错误值得在下一个周期重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Connection(_) | SchedulerError::Sync(_))
    }

    pub fn user_message(&self) -> String {
        match self {
            SchedulerError::Data { issues } if !issues.is_empty() => issues.join("\n"),
            SchedulerError::Data { .. } => "数据访问失败".to_string(),
            SchedulerError::Connection(_) | SchedulerError::ConnectionExhausted { .. } => {
                "无法连接调度控制器，请稍后重试".to_string()
            }
            SchedulerError::InvalidCron { expr, .. } => format!("CRON表达式无效: {expr}"),
            SchedulerError::InvalidTrigger(msg) => format!("触发器配置有误: {msg}"),
            _ => "系统繁忙，请稍后重试".to_string(),
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for SchedulerError {
    fn from(err: config::ConfigError) -> Self {
        SchedulerError::Configuration(err.to_string())
    }
}

/// 用户任务逻辑抛出的错误，每次触发单独记录为 FAILURE 迭代
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
}

impl JobExecutionError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for JobExecutionError {
    fn from(err: SchedulerError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::io::Error> for JobExecutionError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_joins_issues() {
        let err = SchedulerError::data(["code is blank", "group is blank"]);
        assert_eq!(err.to_string(), "数据错误: code is blank; group is blank");
        assert_eq!(err.user_message(), "code is blank\ngroup is blank");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_and_fatal() {
        assert!(SchedulerError::connection("refused").is_retryable());
        assert!(SchedulerError::sync("missing body").is_retryable());
        let exhausted = SchedulerError::ConnectionExhausted {
            attempts: 3,
            last: "refused".to_string(),
        };
        assert!(exhausted.is_fatal());
        assert!(!exhausted.is_retryable());
        assert!(exhausted.to_string().contains("refused"));
    }

    #[test]
    fn test_job_execution_error_from_scheduler_error() {
        let err: JobExecutionError = SchedulerError::Internal("boom".to_string()).into();
        assert!(err.message.contains("boom"));
    }
}
