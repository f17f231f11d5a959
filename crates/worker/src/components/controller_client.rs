use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    ClusterMetadata, CompletionSeverity, ControllerChannel, ExecutionIndexEntry, HeartbeatRequest,
    Iteration, JobExecution, StatusExchangeRequest, StatusExchangeResponse, Worker, WorkerJoin,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 基于 JSON/HTTP 的控制器通道
#[derive(Debug, Clone)]
pub struct HttpChannel {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpChannel {
    pub fn new(base_url: &str) -> SchedulerResult<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> SchedulerResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SchedulerError::config_error(format!("无效的控制器地址 {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(SchedulerError::config_error(format!(
                "控制器地址不能作为基础地址: {base_url}"
            )));
        }
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SchedulerError::config_error(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// 在基础地址后追加 `api/v1/<segments>`，每段都会被正确转义
    pub fn endpoint(&self, segments: &[&str]) -> SchedulerResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SchedulerError::config_error("控制器地址不能作为基础地址"))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    async fn call<B, T>(&self, method: Method, segments: &[&str], body: Option<&B>) -> SchedulerResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        debug!("{} {}", method, url);

        let mut request = self.http_client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!("请求控制器失败: {} {} - {}", method, url, e);
            SchedulerError::connection(format!("{method} {url}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::connection(format!(
                "{method} {url}: HTTP {status} - {body}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SchedulerError::sync(format!("控制器响应格式错误 ({method} {url}): {e}")))
    }
}

#[async_trait]
impl ControllerChannel for HttpChannel {
    async fn metadata(&self, cluster: &str) -> SchedulerResult<ClusterMetadata> {
        self.call::<(), _>(Method::GET, &["clusters", cluster, "metadata"], None)
            .await
    }

    async fn status_exchange(
        &self,
        request: &StatusExchangeRequest,
    ) -> SchedulerResult<StatusExchangeResponse> {
        self.call(Method::POST, &["status-exchange"], Some(request))
            .await
    }

    async fn execution_index(&self, cluster: &str) -> SchedulerResult<Vec<ExecutionIndexEntry>> {
        self.call::<(), _>(
            Method::GET,
            &["clusters", cluster, "executions", "index"],
            None,
        )
        .await
    }

    async fn executions(&self, ids: &[String]) -> SchedulerResult<Vec<JobExecution>> {
        self.call(Method::POST, &["executions", "query"], Some(&json!({ "ids": ids })))
            .await
    }

    async fn complete(
        &self,
        execution_id: &str,
        severity: CompletionSeverity,
    ) -> SchedulerResult<JobExecution> {
        self.call(
            Method::POST,
            &["executions", execution_id, "complete"],
            Some(&json!({ "severity": severity })),
        )
        .await
    }

    async fn iterate(&self, iteration: &Iteration) -> SchedulerResult<Iteration> {
        self.call(Method::POST, &["iterations"], Some(iteration))
            .await
    }

    async fn registration(&self, join: &WorkerJoin) -> SchedulerResult<Worker> {
        self.call(Method::POST, &["workers", "register"], Some(join))
            .await
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        request: &HeartbeatRequest,
    ) -> SchedulerResult<Worker> {
        self.call(Method::POST, &["workers", worker_id, "heartbeat"], Some(request))
            .await
    }
}
