//! 数据仓储契约
//!
//! 由控制器一侧实现并依赖，Worker核心不直接调用。实现在失败时返回
//! `SchedulerError::Data`，携带若干条可读的问题描述。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;

use crate::entities::{
    ExecutionIndexEntry, ExecutionStatus, Iteration, IterationStatus, JobDefinition, JobExecution,
    Worker, WorkerActivity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 从 0 开始
    pub page: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    pub fn offset(&self) -> usize {
        self.page as usize * self.size as usize
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 50 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub size: u32,
}

impl<T> Page<T> {
    /// 对已经过滤好的完整结果做分页
    pub fn slice(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len();
        let items = all
            .into_iter()
            .skip(request.offset())
            .take(request.size as usize)
            .collect();
        Self {
            items,
            total,
            page: request.page,
            size: request.size,
        }
    }

    pub fn has_next(&self) -> bool {
        (self.page as usize + 1) * (self.size as usize) < self.total
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub cluster: Option<String>,
    pub group: Option<String>,
    pub job_type: Option<String>,
    pub code_pattern: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobDefinition) -> bool {
        self.cluster.as_ref().map_or(true, |c| &job.cluster == c)
            && self.group.as_ref().map_or(true, |g| &job.group == g)
            && self.job_type.as_ref().map_or(true, |t| &job.job_type == t)
            && self
                .code_pattern
                .as_ref()
                .map_or(true, |p| job.code.contains(p.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub cluster: Option<String>,
    pub job_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &JobExecution) -> bool {
        self.cluster.as_ref().map_or(true, |c| &execution.cluster == c)
            && self.job_id.as_ref().map_or(true, |j| &execution.job_id == j)
            && self.status.map_or(true, |s| execution.status == s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct IterationFilter {
    pub job_id: Option<String>,
    pub execution_id: Option<String>,
    pub status: Option<IterationStatus>,
    pub since: Option<DateTime<Utc>>,
}

impl IterationFilter {
    pub fn matches(&self, iteration: &Iteration) -> bool {
        self.job_id.as_ref().map_or(true, |j| &iteration.job_id == j)
            && self
                .execution_id
                .as_ref()
                .map_or(true, |e| iteration.execution_id.as_ref() == Some(e))
            && self.status.map_or(true, |s| iteration.status == s)
            && self.since.map_or(true, |t| iteration.timestamp >= t)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub cluster: Option<String>,
    pub activity: Option<WorkerActivity>,
}

impl WorkerFilter {
    pub fn matches(&self, worker: &Worker) -> bool {
        self.cluster.as_ref().map_or(true, |c| &worker.cluster == c)
            && self.activity.map_or(true, |a| worker.last_activity == a)
    }
}

/// 作业定义仓储
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// (code, group) 在集群内唯一，重复创建返回数据错误
    async fn create(&self, job: &JobDefinition) -> SchedulerResult<JobDefinition>;
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<JobDefinition>>;
    async fn find_by_key(
        &self,
        cluster: &str,
        code: &str,
        group: &str,
    ) -> SchedulerResult<Option<JobDefinition>>;
    async fn update(&self, job: &JobDefinition) -> SchedulerResult<JobDefinition>;
    async fn delete(&self, id: &str) -> SchedulerResult<bool>;
    async fn query(
        &self,
        filter: &JobFilter,
        page: PageRequest,
    ) -> SchedulerResult<Page<JobDefinition>>;
}

/// 执行实例仓储
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, execution: &JobExecution) -> SchedulerResult<JobExecution>;
    async fn find_by_ids(&self, ids: &[String]) -> SchedulerResult<Vec<JobExecution>>;
    /// 不允许从 COMPLETED 迁出
    async fn update_status(
        &self,
        id: &str,
        status: ExecutionStatus,
    ) -> SchedulerResult<JobExecution>;
    async fn index(&self, cluster: &str) -> SchedulerResult<Vec<ExecutionIndexEntry>>;
    async fn query(
        &self,
        filter: &ExecutionFilter,
        page: PageRequest,
    ) -> SchedulerResult<Page<JobExecution>>;
}

/// 迭代记录只追加
#[async_trait]
pub trait IterationRepository: Send + Sync {
    async fn append(&self, iteration: &Iteration) -> SchedulerResult<Iteration>;
    async fn query(
        &self,
        filter: &IterationFilter,
        page: PageRequest,
    ) -> SchedulerResult<Page<Iteration>>;
}

#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn upsert(&self, worker: &Worker) -> SchedulerResult<Worker>;
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Worker>>;
    async fn query(&self, filter: &WorkerFilter, page: PageRequest)
        -> SchedulerResult<Page<Worker>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_slice() {
        let page = Page::slice((0..7).collect::<Vec<_>>(), PageRequest::new(1, 3));
        assert_eq!(page.items, vec![3, 4, 5]);
        assert_eq!(page.total, 7);
        assert!(page.has_next());

        let last = Page::slice((0..7).collect::<Vec<_>>(), PageRequest::new(2, 3));
        assert_eq!(last.items, vec![6]);
        assert!(!last.has_next());
    }

    #[test]
    fn test_job_filter() {
        let job = JobDefinition::new("nightly-report", "reports", "shell", "main");
        let filter = JobFilter {
            group: Some("reports".to_string()),
            code_pattern: Some("night".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&job));

        let other = JobFilter {
            job_type: Some("http".to_string()),
            ..Default::default()
        };
        assert!(!other.matches(&job));
    }
}
