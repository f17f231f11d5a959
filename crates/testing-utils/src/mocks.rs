//! 脚本化的控制器通道
//!
//! 每个通道操作都可以预置返回值或错误，并记录调用参数，供测试断言调用次数与内容。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    ClusterMetadata, CompletionSeverity, ControllerChannel, ExecutionIndexEntry, ExecutionStatus,
    HeartbeatRequest, Iteration, JobDefinition, JobExecution, StatusExchangeRequest,
    StatusExchangeResponse, Worker, WorkerActivity, WorkerJoin,
};

#[derive(Debug, Default)]
struct MockState {
    metadata: ClusterMetadata,
    metadata_error: Option<SchedulerError>,
    status_responses: HashMap<(String, String), VecDeque<StatusExchangeResponse>>,
    status_errors: HashMap<String, SchedulerError>,
    status_requests: Vec<StatusExchangeRequest>,
    execution_index: Vec<ExecutionIndexEntry>,
    index_error: Option<SchedulerError>,
    index_calls: usize,
    executions: HashMap<String, JobExecution>,
    failing_execution_ids: HashSet<String>,
    execution_requests: Vec<Vec<String>>,
    completions: Vec<(String, CompletionSeverity)>,
    iterations: Vec<Iteration>,
    iterate_error: Option<SchedulerError>,
    registration_failures: u32,
    registration_always_fails: bool,
    joins: Vec<WorkerJoin>,
    worker: Option<Worker>,
    heartbeats: Vec<(String, WorkerActivity)>,
    heartbeat_error: Option<SchedulerError>,
}

/// Mock implementation of ControllerChannel for testing
#[derive(Debug, Default)]
pub struct MockChannel {
    state: Mutex<MockState>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_metadata(&self, metadata: ClusterMetadata) {
        let mut state = self.state.lock().unwrap();
        state.metadata = metadata;
        state.metadata_error = None;
    }

    pub fn fail_metadata(&self, error: SchedulerError) {
        self.state.lock().unwrap().metadata_error = Some(error);
    }

    /// 为 (group, type) 追加一次状态交换响应，未预置时返回空响应
    pub fn push_status_response(&self, group: &str, job_type: &str, response: StatusExchangeResponse) {
        self.state
            .lock()
            .unwrap()
            .status_responses
            .entry((group.to_string(), job_type.to_string()))
            .or_default()
            .push_back(response);
    }

    pub fn fail_status_exchange_for(&self, group: &str, error: SchedulerError) {
        self.state
            .lock()
            .unwrap()
            .status_errors
            .insert(group.to_string(), error);
    }

    pub fn status_requests(&self) -> Vec<StatusExchangeRequest> {
        self.state.lock().unwrap().status_requests.clone()
    }

    pub fn set_execution_index(&self, index: Vec<ExecutionIndexEntry>) {
        let mut state = self.state.lock().unwrap();
        state.execution_index = index;
        state.index_error = None;
    }

    pub fn fail_execution_index(&self, error: SchedulerError) {
        self.state.lock().unwrap().index_error = Some(error);
    }

    pub fn index_calls(&self) -> usize {
        self.state.lock().unwrap().index_calls
    }

    /// 预置一个可被 `executions` 拉取到的执行实例
    pub fn add_execution(&self, execution: JobExecution) {
        self.state
            .lock()
            .unwrap()
            .executions
            .insert(execution.id.clone(), execution);
    }

    /// 请求中包含该 id 的批次会失败
    pub fn fail_executions_containing(&self, execution_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_execution_ids
            .insert(execution_id.to_string());
    }

    pub fn clear_execution_failures(&self) {
        self.state.lock().unwrap().failing_execution_ids.clear();
    }

    pub fn execution_requests(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().execution_requests.clone()
    }

    pub fn completions(&self) -> Vec<(String, CompletionSeverity)> {
        self.state.lock().unwrap().completions.clone()
    }

    pub fn iterations(&self) -> Vec<Iteration> {
        self.state.lock().unwrap().iterations.clone()
    }

    pub fn fail_iterate(&self, error: SchedulerError) {
        self.state.lock().unwrap().iterate_error = Some(error);
    }

    /// 前 `count` 次注册失败
    pub fn fail_registrations(&self, count: u32) {
        self.state.lock().unwrap().registration_failures = count;
    }

    pub fn always_fail_registration(&self) {
        self.state.lock().unwrap().registration_always_fails = true;
    }

    pub fn registration_attempts(&self) -> usize {
        self.state.lock().unwrap().joins.len()
    }

    pub fn joins(&self) -> Vec<WorkerJoin> {
        self.state.lock().unwrap().joins.clone()
    }

    pub fn heartbeats(&self) -> Vec<(String, WorkerActivity)> {
        self.state.lock().unwrap().heartbeats.clone()
    }

    pub fn fail_heartbeat(&self, error: SchedulerError) {
        self.state.lock().unwrap().heartbeat_error = Some(error);
    }

    pub fn clear_heartbeat_failure(&self) {
        self.state.lock().unwrap().heartbeat_error = None;
    }
}

#[async_trait]
impl ControllerChannel for MockChannel {
    async fn metadata(&self, _cluster: &str) -> SchedulerResult<ClusterMetadata> {
        let state = self.state.lock().unwrap();
        match &state.metadata_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.metadata.clone()),
        }
    }

    async fn status_exchange(
        &self,
        request: &StatusExchangeRequest,
    ) -> SchedulerResult<StatusExchangeResponse> {
        let mut state = self.state.lock().unwrap();
        state.status_requests.push(request.clone());
        if let Some(error) = state.status_errors.get(&request.group) {
            return Err(error.clone());
        }
        Ok(state
            .status_responses
            .get_mut(&(request.group.clone(), request.job_type.clone()))
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }

    async fn execution_index(&self, _cluster: &str) -> SchedulerResult<Vec<ExecutionIndexEntry>> {
        let mut state = self.state.lock().unwrap();
        state.index_calls += 1;
        match &state.index_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.execution_index.clone()),
        }
    }

    async fn executions(&self, ids: &[String]) -> SchedulerResult<Vec<JobExecution>> {
        let mut state = self.state.lock().unwrap();
        state.execution_requests.push(ids.to_vec());
        if ids.iter().any(|id| state.failing_execution_ids.contains(id)) {
            return Err(SchedulerError::connection("execution fetch failed"));
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.executions.get(id).cloned())
            .collect())
    }

    async fn complete(
        &self,
        execution_id: &str,
        severity: CompletionSeverity,
    ) -> SchedulerResult<JobExecution> {
        let mut state = self.state.lock().unwrap();
        state.completions.push((execution_id.to_string(), severity));
        let mut execution = state
            .executions
            .get(execution_id)
            .cloned()
            .unwrap_or_else(|| {
                let definition = JobDefinition::new("unknown", "unknown", "unknown", "main");
                JobExecution {
                    id: execution_id.to_string(),
                    job_id: definition.id.clone(),
                    status: ExecutionStatus::Active,
                    completion_severity: None,
                    payload: Default::default(),
                    cluster: definition.cluster.clone(),
                    tenant: None,
                    definition,
                }
            });
        execution.status = ExecutionStatus::Completed;
        execution.completion_severity = Some(severity);
        Ok(execution)
    }

    async fn iterate(&self, iteration: &Iteration) -> SchedulerResult<Iteration> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.iterate_error {
            return Err(error.clone());
        }
        state.iterations.push(iteration.clone());
        Ok(iteration.clone())
    }

    async fn registration(&self, join: &WorkerJoin) -> SchedulerResult<Worker> {
        let mut state = self.state.lock().unwrap();
        state.joins.push(join.clone());
        if state.registration_always_fails {
            return Err(SchedulerError::connection("registration refused"));
        }
        if state.registration_failures > 0 {
            state.registration_failures -= 1;
            return Err(SchedulerError::connection("registration refused"));
        }

        let worker = Worker {
            id: format!("worker-{}", state.joins.len()),
            name: join.name.clone(),
            cluster: join.cluster.clone(),
            kind: join.kind,
            session: join.session.clone(),
            last_activity: WorkerActivity::Register,
            updated_at: Utc::now(),
        };
        state.worker = Some(worker.clone());
        Ok(worker)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        request: &HeartbeatRequest,
    ) -> SchedulerResult<Worker> {
        let mut state = self.state.lock().unwrap();
        state
            .heartbeats
            .push((worker_id.to_string(), request.activity));
        if let Some(error) = &state.heartbeat_error {
            return Err(error.clone());
        }
        let mut worker = state
            .worker
            .clone()
            .ok_or_else(|| SchedulerError::connection(format!("unknown worker {worker_id}")))?;
        worker.last_activity = request.activity;
        worker.updated_at = Utc::now();
        state.worker = Some(worker.clone());
        Ok(worker)
    }
}
