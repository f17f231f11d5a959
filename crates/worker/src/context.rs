use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use scheduler_core::JobExecutionError;
use scheduler_domain::{JobExecution, JobDefinition, Payload};

/// 按键查找的模块表，在配置阶段构建一次，随上下文传入每次执行
#[derive(Clone, Default)]
pub struct Modules {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Modules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, module: T) -> Self {
        self.insert(key, module);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, module: T) {
        self.entries.insert(key.into(), Arc::new(module));
    }

    /// 类型不匹配时返回 None
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.entries
            .get(key)
            .cloned()
            .and_then(|module| module.downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for Modules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modules").field("keys", &self.keys()).finish()
    }
}

/// 合并后的作业参数只读视图
#[derive(Debug, Clone, Default)]
pub struct PayloadReader {
    values: Payload,
}

impl PayloadReader {
    pub fn new(values: Payload) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(|v| v.as_bool())
    }

    pub fn require_str(&self, key: &str) -> Result<&str, JobExecutionError> {
        self.get_str(key)
            .ok_or_else(|| JobExecutionError::new(format!("缺少字符串参数: {key}")))
    }

    /// 把参数反序列化成指定类型，不存在时返回 None
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, JobExecutionError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| JobExecutionError::new(format!("参数 {key} 格式错误: {e}"))),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn as_map(&self) -> &Payload {
        &self.values
    }
}

/// 执行输出，作为迭代消息上报
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    lines: Vec<String>,
}

impl OutputSink {
    pub fn write(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_message(&self) -> Option<String> {
        (!self.lines.is_empty()).then(|| self.lines.join("\n"))
    }
}

/// 传给用户执行逻辑的上下文
#[derive(Debug)]
pub struct JobContext {
    execution_id: Option<String>,
    job_id: String,
    job_type: String,
    folder: String,
    name: String,
    trigger_key: String,
    fire_time: DateTime<Utc>,
    payload: PayloadReader,
    modules: Arc<Modules>,
    output: OutputSink,
}

impl JobContext {
    pub fn new(
        definition: &JobDefinition,
        execution: Option<&JobExecution>,
        trigger_key: impl Into<String>,
        fire_time: DateTime<Utc>,
        payload: Payload,
        modules: Arc<Modules>,
    ) -> Self {
        Self {
            execution_id: execution.map(|e| e.id.clone()),
            job_id: definition.id.clone(),
            job_type: definition.job_type.clone(),
            folder: definition.group.clone(),
            name: definition.code.clone(),
            trigger_key: trigger_key.into(),
            fire_time,
            payload: PayloadReader::new(payload),
            modules,
            output: OutputSink::default(),
        }
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trigger_key(&self) -> &str {
        &self.trigger_key
    }

    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    pub fn payload(&self) -> &PayloadReader {
        &self.payload
    }

    pub fn module<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.modules.get(key)
    }

    pub fn output(&mut self) -> &mut OutputSink {
        &mut self.output
    }

    pub fn output_ref(&self) -> &OutputSink {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    struct Mailer {
        host: String,
    }

    #[test]
    fn test_modules_typed_lookup() {
        let modules = Modules::new().with(
            "mailer",
            Mailer {
                host: "smtp.local".to_string(),
            },
        );
        assert_eq!(modules.get::<Mailer>("mailer").unwrap().host, "smtp.local");
        assert!(modules.get::<String>("mailer").is_none());
        assert!(modules.get::<Mailer>("missing").is_none());
    }

    #[test]
    fn test_payload_reader() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Window {
            from: u32,
            to: u32,
        }

        let mut payload = Payload::new();
        payload.insert("target".into(), json!("orders"));
        payload.insert("limit".into(), json!(25));
        payload.insert("window".into(), json!({"from": 1, "to": 5}));
        let reader = PayloadReader::new(payload);

        assert_eq!(reader.require_str("target").unwrap(), "orders");
        assert_eq!(reader.get_i64("limit"), Some(25));
        assert!(reader.require_str("limit").is_err());
        assert_eq!(
            reader.get_as::<Window>("window").unwrap(),
            Some(Window { from: 1, to: 5 })
        );
        assert!(reader.get_as::<Window>("limit").is_err());
        assert_eq!(reader.get_as::<Window>("absent").unwrap(), None);
    }

    #[test]
    fn test_context_exposes_identity_and_output() {
        let definition = JobDefinition::new("cleanup", "ops", "shell", "main");
        let mut context = JobContext::new(
            &definition,
            None,
            "nightly",
            Utc::now(),
            Payload::new(),
            Arc::new(Modules::new()),
        );
        assert_eq!(context.folder(), "ops");
        assert_eq!(context.name(), "cleanup");
        assert_eq!(context.execution_id(), None);

        context.output().write("step 1");
        context.output().write("step 2");
        assert_eq!(
            context.output_ref().to_message().as_deref(),
            Some("step 1\nstep 2")
        );
    }
}
