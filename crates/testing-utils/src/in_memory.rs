//! 内存版数据仓储
//!
//! 实现控制器一侧依赖的全部仓储契约，失败时返回携带问题列表的数据错误。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    ExecutionFilter, ExecutionIndexEntry, ExecutionRepository, ExecutionStatus, Iteration,
    IterationFilter, IterationRepository, JobDefinition, JobExecution, JobFilter, JobRepository,
    Page, PageRequest, Worker, WorkerFilter, WorkerRepository,
};

#[derive(Debug, Default)]
struct Store {
    jobs: HashMap<String, JobDefinition>,
    executions: HashMap<String, JobExecution>,
    iterations: Vec<Iteration>,
    workers: HashMap<String, Worker>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    store: Arc<Mutex<Store>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.store.lock().unwrap().jobs.len()
    }

    pub fn clear(&self) {
        *self.store.lock().unwrap() = Store::default();
    }
}

fn job_issues(job: &JobDefinition) -> Vec<String> {
    let mut issues = Vec::new();
    if job.code.trim().is_empty() {
        issues.push("作业编码不能为空".to_string());
    }
    if job.group.trim().is_empty() {
        issues.push("作业分组不能为空".to_string());
    }
    if job.job_type.trim().is_empty() {
        issues.push("作业类型不能为空".to_string());
    }
    if job.cluster.trim().is_empty() {
        issues.push("集群不能为空".to_string());
    }
    issues
}

fn key_taken(store: &Store, job: &JobDefinition) -> bool {
    store.jobs.values().any(|existing| {
        existing.id != job.id
            && existing.cluster == job.cluster
            && existing.code == job.code
            && existing.group == job.group
    })
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    async fn create(&self, job: &JobDefinition) -> SchedulerResult<JobDefinition> {
        let mut store = self.store.lock().unwrap();
        let mut issues = job_issues(job);
        if store.jobs.contains_key(&job.id) {
            issues.push(format!("作业 id {} 已存在", job.id));
        }
        if key_taken(&store, job) {
            issues.push(format!("{} 在集群 {} 中已存在", job.key(), job.cluster));
        }
        if !issues.is_empty() {
            return Err(SchedulerError::data(issues));
        }

        let mut created = job.clone();
        let now = Utc::now();
        created.created_at = now;
        created.modified_at = now;
        store.jobs.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<JobDefinition>> {
        Ok(self.store.lock().unwrap().jobs.get(id).cloned())
    }

    async fn find_by_key(
        &self,
        cluster: &str,
        code: &str,
        group: &str,
    ) -> SchedulerResult<Option<JobDefinition>> {
        Ok(self
            .store
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| j.cluster == cluster && j.code == code && j.group == group)
            .cloned())
    }

    async fn update(&self, job: &JobDefinition) -> SchedulerResult<JobDefinition> {
        let mut store = self.store.lock().unwrap();
        let mut issues = job_issues(job);
        if !store.jobs.contains_key(&job.id) {
            issues.push(format!("作业 {} 不存在", job.id));
        }
        if key_taken(&store, job) {
            issues.push(format!("{} 在集群 {} 中已存在", job.key(), job.cluster));
        }
        if !issues.is_empty() {
            return Err(SchedulerError::data(issues));
        }

        let mut updated = job.clone();
        updated.modified_at = Utc::now();
        store.jobs.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        Ok(self.store.lock().unwrap().jobs.remove(id).is_some())
    }

    async fn query(
        &self,
        filter: &JobFilter,
        page: PageRequest,
    ) -> SchedulerResult<Page<JobDefinition>> {
        let store = self.store.lock().unwrap();
        let mut jobs: Vec<_> = store
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (&a.group, &a.code).cmp(&(&b.group, &b.code)));
        Ok(Page::slice(jobs, page))
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn create(&self, execution: &JobExecution) -> SchedulerResult<JobExecution> {
        let mut store = self.store.lock().unwrap();
        let mut issues = Vec::new();
        if store.executions.contains_key(&execution.id) {
            issues.push(format!("执行实例 {} 已存在", execution.id));
        }
        if !store.jobs.contains_key(&execution.job_id) {
            issues.push(format!("作业 {} 不存在", execution.job_id));
        }
        if !issues.is_empty() {
            return Err(SchedulerError::data(issues));
        }
        store
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(execution.clone())
    }

    async fn find_by_ids(&self, ids: &[String]) -> SchedulerResult<Vec<JobExecution>> {
        let store = self.store.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| store.executions.get(id).cloned())
            .collect())
    }

    async fn update_status(
        &self,
        id: &str,
        status: ExecutionStatus,
    ) -> SchedulerResult<JobExecution> {
        let mut store = self.store.lock().unwrap();
        let execution = store
            .executions
            .get_mut(id)
            .ok_or_else(|| SchedulerError::data([format!("执行实例 {id} 不存在")]))?;
        if !execution.status.can_transition_to(status) {
            return Err(SchedulerError::data([format!(
                "执行实例 {id} 已完成，不能迁移到 {status:?}"
            )]));
        }
        execution.status = status;
        Ok(execution.clone())
    }

    async fn index(&self, cluster: &str) -> SchedulerResult<Vec<ExecutionIndexEntry>> {
        let store = self.store.lock().unwrap();
        let mut index: Vec<_> = store
            .executions
            .values()
            .filter(|e| e.cluster == cluster)
            .map(|e| ExecutionIndexEntry::new(e.id.clone(), e.job_id.clone(), e.status))
            .collect();
        index.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
        Ok(index)
    }

    async fn query(
        &self,
        filter: &ExecutionFilter,
        page: PageRequest,
    ) -> SchedulerResult<Page<JobExecution>> {
        let store = self.store.lock().unwrap();
        let mut executions: Vec<_> = store
            .executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Page::slice(executions, page))
    }
}

#[async_trait]
impl IterationRepository for InMemoryRepository {
    async fn append(&self, iteration: &Iteration) -> SchedulerResult<Iteration> {
        let mut store = self.store.lock().unwrap();
        if store.iterations.iter().any(|i| i.id == iteration.id) {
            return Err(SchedulerError::data([format!(
                "迭代 {} 已存在，迭代记录不可修改",
                iteration.id
            )]));
        }
        store.iterations.push(iteration.clone());
        Ok(iteration.clone())
    }

    async fn query(
        &self,
        filter: &IterationFilter,
        page: PageRequest,
    ) -> SchedulerResult<Page<Iteration>> {
        let store = self.store.lock().unwrap();
        let mut iterations: Vec<_> = store
            .iterations
            .iter()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        iterations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(Page::slice(iterations, page))
    }
}

#[async_trait]
impl WorkerRepository for InMemoryRepository {
    async fn upsert(&self, worker: &Worker) -> SchedulerResult<Worker> {
        let mut store = self.store.lock().unwrap();
        let mut saved = worker.clone();
        saved.updated_at = Utc::now();
        store.workers.insert(saved.id.clone(), saved.clone());
        Ok(saved)
    }

    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self.store.lock().unwrap().workers.get(id).cloned())
    }

    async fn query(
        &self,
        filter: &WorkerFilter,
        page: PageRequest,
    ) -> SchedulerResult<Page<Worker>> {
        let store = self.store.lock().unwrap();
        let mut workers: Vec<_> = store
            .workers
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Page::slice(workers, page))
    }
}
