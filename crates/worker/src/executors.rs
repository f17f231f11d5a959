use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info};

use scheduler_core::JobExecutionError;

use crate::context::{JobContext, PayloadReader};
use crate::executor_registry::Executor;

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    /// 要执行的命令
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// 超时时间（秒）
    pub timeout_seconds: Option<u64>,
}

const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 300;

fn params_from<T: DeserializeOwned>(payload: &PayloadReader, kind: &str) -> Result<T, JobExecutionError> {
    let object: serde_json::Map<String, serde_json::Value> = payload
        .as_map()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| JobExecutionError::new(format!("解析{kind}任务参数失败: {e}")))
}

/// Shell任务执行器
#[derive(Debug, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, context: &mut JobContext) -> Result<(), JobExecutionError> {
        let start_time = Instant::now();
        let params: ShellTaskParams = params_from(context.payload(), "Shell")?;

        info!(
            "执行Shell任务: job={}.{}, command={}, args={:?}",
            context.folder(),
            context.name(),
            params.command,
            params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(ref dir) = params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &params.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| JobExecutionError::new(format!("启动Shell命令失败: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobExecutionError::new("无法获取stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobExecutionError::new("无法获取stderr"))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();

        let stdout_task = async {
            while let Ok(Some(line)) = stdout_reader.next_line().await {
                stdout_lines.push(line);
            }
        };
        let stderr_task = async {
            while let Ok(Some(line)) = stderr_reader.next_line().await {
                stderr_lines.push(line);
            }
        };
        tokio::join!(stdout_task, stderr_task);

        let exit_status = child
            .wait()
            .await
            .map_err(|e| JobExecutionError::new(format!("等待进程结束失败: {e}")))?;

        for line in stdout_lines {
            context.output().write(line);
        }

        info!(
            "Shell任务执行完成: job={}.{}, success={}, exit_code={:?}, duration={}ms",
            context.folder(),
            context.name(),
            exit_status.success(),
            exit_status.code(),
            start_time.elapsed().as_millis()
        );

        if exit_status.success() {
            Ok(())
        } else if stderr_lines.is_empty() {
            Err(JobExecutionError::new(format!(
                "命令执行失败，退出码: {:?}",
                exit_status.code()
            )))
        } else {
            Err(JobExecutionError::new(stderr_lines.join("\n")))
        }
    }
}

/// HTTP任务执行器
#[derive(Debug, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, context: &mut JobContext) -> Result<(), JobExecutionError> {
        let start_time = Instant::now();
        let params: HttpTaskParams = params_from(context.payload(), "HTTP")?;
        let method = params
            .method
            .clone()
            .unwrap_or_else(|| "GET".to_string())
            .to_uppercase();

        info!(
            "执行HTTP任务: job={}.{}, method={}, url={}",
            context.folder(),
            context.name(),
            method,
            params.url
        );

        let mut request_builder = match method.as_str() {
            "GET" => self.client.get(&params.url),
            "POST" => self.client.post(&params.url),
            "PUT" => self.client.put(&params.url),
            "DELETE" => self.client.delete(&params.url),
            "PATCH" => self.client.patch(&params.url),
            "HEAD" => self.client.head(&params.url),
            _ => {
                return Err(JobExecutionError::new(format!("不支持的HTTP方法: {method}")));
            }
        };

        request_builder = request_builder.timeout(Duration::from_secs(
            params.timeout_seconds.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECONDS),
        ));
        for (key, value) in &params.headers {
            request_builder = request_builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = params.body {
            request_builder = request_builder.body(body);
        }

        let response = request_builder.send().await.map_err(|e| {
            error!(
                "HTTP任务执行失败: job={}.{}, error={}",
                context.folder(),
                context.name(),
                e
            );
            JobExecutionError::new(format!("HTTP请求失败: {e}"))
        })?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("读取响应体失败: {e}"));

        context.output().write(format!("HTTP {method} {}", params.url));
        context.output().write(format!("Status: {}", status.as_u16()));
        if !response_body.is_empty() {
            context.output().write(response_body);
        }

        info!(
            "HTTP任务执行完成: job={}.{}, status={}, duration={}ms",
            context.folder(),
            context.name(),
            status.as_u16(),
            start_time.elapsed().as_millis()
        );

        if status.is_success() {
            Ok(())
        } else {
            Err(JobExecutionError::new(format!(
                "HTTP请求失败，状态码: {}",
                status.as_u16()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Modules;
    use chrono::Utc;
    use scheduler_domain::{JobDefinition, Payload};
    use serde_json::json;
    use std::sync::Arc;

    fn context(job_type: &str, payload: Payload) -> JobContext {
        let definition = JobDefinition::new("smoke", "ops", job_type, "main");
        JobContext::new(
            &definition,
            None,
            "manual",
            Utc::now(),
            payload,
            Arc::new(Modules::new()),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_collects_stdout() {
        let mut payload = Payload::new();
        payload.insert("command".into(), json!("echo"));
        payload.insert("args".into(), json!(["hello", "world"]));
        let mut ctx = context("shell", payload);

        ShellExecutor::new().execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.output_ref().lines(), ["hello world".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_reports_non_zero_exit() {
        let mut payload = Payload::new();
        payload.insert("command".into(), json!("sh"));
        payload.insert("args".into(), json!(["-c", "echo broken >&2; exit 3"]));
        let mut ctx = context("shell", payload);

        let err = ShellExecutor::new().execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.message, "broken");
    }

    #[tokio::test]
    async fn test_missing_parameters_fail_the_firing() {
        let mut ctx = context("shell", Payload::new());
        let err = ShellExecutor::new().execute(&mut ctx).await.unwrap_err();
        assert!(err.message.contains("Shell"));

        let mut ctx = context("http", Payload::new());
        let err = HttpExecutor::new().execute(&mut ctx).await.unwrap_err();
        assert!(err.message.contains("HTTP"));
    }

    #[tokio::test]
    async fn test_http_executor_rejects_unknown_method() {
        let mut payload = Payload::new();
        payload.insert("url".into(), json!("http://127.0.0.1:9"));
        payload.insert("method".into(), json!("brew"));
        let mut ctx = context("http", payload);

        let err = HttpExecutor::new().execute(&mut ctx).await.unwrap_err();
        assert!(err.message.contains("BREW"));
    }
}
