use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use tracing::debug;

use super::WorkerConfig;
use crate::{SchedulerError, SchedulerResult};

const DEFAULT_PATHS: [&str; 3] = [
    "config/worker.toml",
    "worker.toml",
    "/etc/fleet-scheduler/worker.toml",
];

/// 从TOML文件与环境变量加载 [`WorkerConfig`]
pub struct ConfigLoader {
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            env_prefix: "FLEET".to_string(),
        }
    }

    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(&self, config_path: Option<&str>) -> SchedulerResult<WorkerConfig> {
        let mut builder = ConfigBuilder::builder();

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(SchedulerError::Configuration(format!(
                        "配置文件不存在: {path}"
                    )));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
                    debug!("使用默认配置文件: {}", path);
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: WorkerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_str(&self, content: &str) -> SchedulerResult<WorkerConfig> {
        let config: WorkerConfig = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::{PersistenceBackend, WorkerKind};

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
cluster = "payments"
name = "worker-a"
kind = "BALANCED"
poll_interval_ms = 2000
registration_tries = 5

[persistence]
backend = "database"
url = "postgres://db/triggers"
pool_size = 8

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_env_prefix("FLEET_LOADER_TEST")
            .load(Some(file.path().to_str().unwrap()))
            .unwrap();

        assert_eq!(config.cluster, "payments");
        assert_eq!(config.name.as_deref(), Some("worker-a"));
        assert_eq!(config.kind, WorkerKind::Balanced);
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.registration_tries, 5);
        assert_eq!(config.persistence.backend, PersistenceBackend::Database);
        assert_eq!(config.persistence.pool_size, 8);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.parallelism, 4);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = ConfigLoader::new().load(Some("/nonexistent/worker.toml"));
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
    }

    #[test]
    fn test_load_from_str_applies_defaults() {
        let config = ConfigLoader::new()
            .load_from_str("cluster = \"main\"")
            .unwrap();
        assert_eq!(config.kind, WorkerKind::Replica);
        assert_eq!(config.persistence.pool_size, 5);
        assert_eq!(config.execution_chunk_size, 100);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = ConfigLoader::new().load_from_str("cluster = \"main\"\nparallelism = 0");
        assert!(result.is_err());
    }
}
