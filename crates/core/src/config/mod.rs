//! Worker配置
//!
//! 配置来源按优先级从低到高：内置默认值、TOML配置文件、`FLEET__` 前缀的环境变量。

mod loader;
mod worker_config;

pub use loader::ConfigLoader;
pub use worker_config::{
    LoggingConfig, ObservabilityConfig, PersistenceBackend, PersistenceConfig, WorkerConfig,
    WorkerKind,
};
