use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{SchedulerError, SchedulerResult};

/// 初始化日志系统
///
/// `RUST_LOG` 存在时优先于配置中的级别。重复初始化会返回配置错误。
pub fn init_logging(log_level: &str, log_format: &str) -> SchedulerResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match log_format {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_thread_ids(true)
                    .with_target(false),
            )
            .try_init(),
    };

    result.map_err(|e| SchedulerError::Configuration(format!("初始化日志系统失败: {e}")))
}
