//! 与控制器通信的通道端口
//!
//! 传输与路由由实现方负责。所有调用都是一次性完成的异步调用，失败时直接返回错误，
//! 调用方不在周期内重试。

use async_trait::async_trait;
use scheduler_core::SchedulerResult;

use crate::entities::{
    ClusterMetadata, CompletionSeverity, ExecutionIndexEntry, HeartbeatRequest, Iteration,
    JobExecution, StatusExchangeRequest, StatusExchangeResponse, Worker, WorkerJoin,
};

#[async_trait]
pub trait ControllerChannel: Send + Sync {
    async fn metadata(&self, cluster: &str) -> SchedulerResult<ClusterMetadata>;

    async fn status_exchange(
        &self,
        request: &StatusExchangeRequest,
    ) -> SchedulerResult<StatusExchangeResponse>;

    async fn execution_index(&self, cluster: &str) -> SchedulerResult<Vec<ExecutionIndexEntry>>;

    async fn executions(&self, ids: &[String]) -> SchedulerResult<Vec<JobExecution>>;

    async fn complete(
        &self,
        execution_id: &str,
        severity: CompletionSeverity,
    ) -> SchedulerResult<JobExecution>;

    async fn iterate(&self, iteration: &Iteration) -> SchedulerResult<Iteration>;

    async fn registration(&self, join: &WorkerJoin) -> SchedulerResult<Worker>;

    async fn heartbeat(&self, worker_id: &str, request: &HeartbeatRequest)
        -> SchedulerResult<Worker>;
}
