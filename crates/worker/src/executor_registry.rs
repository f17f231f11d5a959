use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use scheduler_core::{JobExecutionError, SchedulerError, SchedulerResult};

use crate::context::{JobContext, Modules};

/// 用户作业逻辑
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, context: &mut JobContext) -> Result<(), JobExecutionError>;
}

/// 在启动阶段用模块表构造执行器
pub type ExecutorFactory =
    Box<dyn Fn(&Modules) -> SchedulerResult<Arc<dyn Executor>> + Send + Sync>;

/// 收集命名工厂，`build` 时一次性解析成 [`ExecutorRegistry`]
#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    factories: Vec<(String, ExecutorFactory)>,
}

impl ExecutorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory<F>(mut self, job_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Modules) -> SchedulerResult<Arc<dyn Executor>> + Send + Sync + 'static,
    {
        self.factories.push((job_type.into(), Box::new(factory)));
        self
    }

    pub fn register_executor(self, job_type: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.register_factory(job_type, move |_| Ok(Arc::clone(&executor)))
    }

    pub fn build(self, modules: &Modules) -> SchedulerResult<ExecutorRegistry> {
        let mut executors = HashMap::with_capacity(self.factories.len());
        for (job_type, factory) in self.factories {
            if executors.contains_key(&job_type) {
                return Err(SchedulerError::config_error(format!(
                    "作业类型 '{job_type}' 重复注册执行器"
                )));
            }
            let executor = factory(modules)?;
            info!("注册执行器: {}", job_type);
            executors.insert(job_type, executor);
        }
        Ok(ExecutorRegistry { executors })
    }
}

/// 作业类型到执行器的映射，构建后只读
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::new()
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.executors.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
