//! 进程内调度实例
//!
//! 保存当前进程已调度的作业与执行实例。所有变更与状态读取共用同一把锁；
//! 每个条目有一个独立的触发循环任务，触发本身在循环之外异步执行。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scheduler_domain::{
    CompletionSeverity, ExecutionKey, ExecutionStatus, IterationStatus, JobDefinition, JobExecution,
    JobKey, Payload,
};

use crate::trigger_engine::{ScheduleEntry, TriggerEngine};

/// 超过该延迟的重复触发视为错过，直接跳到下一次
const MISFIRE_THRESHOLD_MS: i64 = 5_000;

/// 一个被调度的单元：作业定义，或附带定义快照的执行实例
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub definition: JobDefinition,
    pub execution: Option<JobExecution>,
}

impl ScheduledJob {
    pub fn silent_iterations(&self) -> bool {
        self.definition.execution_options.silent_iterations
    }

    pub fn describe(&self) -> String {
        match &self.execution {
            Some(execution) => format!("执行实例 {}", execution.key()),
            None => format!("作业 {}", self.definition.key()),
        }
    }
}

/// 一次到期的触发
#[derive(Debug, Clone)]
pub struct Firing {
    pub job: Arc<ScheduledJob>,
    pub trigger_key: String,
    pub fire_time: DateTime<Utc>,
    pub payload: Payload,
}

/// 执行实例的触发结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FiringTally {
    pub successes: u32,
    pub failures: u32,
}

impl FiringTally {
    pub fn total(&self) -> u32 {
        self.successes + self.failures
    }

    /// 没有触发为 INCOMPLETE，全部成功为 SUCCESS，全部失败为 FAIL，其余为 WARNING
    pub fn severity(&self) -> CompletionSeverity {
        match (self.successes, self.failures) {
            (0, 0) => CompletionSeverity::Incomplete,
            (_, 0) => CompletionSeverity::Success,
            (0, _) => CompletionSeverity::Fail,
            _ => CompletionSeverity::Warning,
        }
    }
}

#[derive(Debug, Default)]
struct SharedTally {
    successes: AtomicU32,
    failures: AtomicU32,
}

impl SharedTally {
    fn record(&self, status: IterationStatus) {
        match status {
            IterationStatus::Success => self.successes.fetch_add(1, Ordering::Relaxed),
            IterationStatus::Failure => self.failures.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> FiringTally {
        FiringTally {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// 到期触发的处理方
#[async_trait]
pub trait FiringHandler: Send + Sync {
    /// 返回 None 表示本次触发被跳过（例如未取得集群锁）
    async fn fire(&self, firing: Firing) -> Option<IterationStatus>;

    /// 执行实例的所有触发器都已耗尽且在途触发已结束
    async fn exhausted(&self, job: Arc<ScheduledJob>, tally: FiringTally);
}

/// 本地执行实例快照：已调度的键，以及其中处于暂停的键
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    pub known: HashSet<ExecutionKey>,
    pub paused: HashSet<ExecutionKey>,
}

struct Slot {
    job: Arc<ScheduledJob>,
    entries: Vec<ScheduleEntry>,
    paused: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn trigger_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().to_string()).collect()
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct ScheduleState {
    running: bool,
    jobs: HashMap<JobKey, Slot>,
    executions: HashMap<ExecutionKey, Slot>,
}

/// 进程内调度实例
pub struct LocalScheduleInstance {
    engine: TriggerEngine,
    handler: Arc<dyn FiringHandler>,
    state: Mutex<ScheduleState>,
}

impl LocalScheduleInstance {
    pub fn new(engine: TriggerEngine, handler: Arc<dyn FiringHandler>) -> Self {
        Self {
            engine,
            handler,
            state: Mutex::new(ScheduleState::default()),
        }
    }

    /// 启动后才会为条目创建触发循环，启动前登记的条目在此时开始运行
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.running {
            return;
        }
        state.running = true;

        let ScheduleState {
            jobs, executions, ..
        } = &mut *state;
        for slot in jobs.values_mut().chain(executions.values_mut()) {
            slot.task = Some(self.spawn_loop(slot));
        }
        info!(
            "调度实例已启动: {} 个作业, {} 个执行实例",
            jobs.len(),
            executions.len()
        );
    }

    /// 停止所有触发循环并清空本地调度；在途触发不会被中断
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }
        state.running = false;
        let ScheduleState {
            jobs, executions, ..
        } = &mut *state;
        for slot in jobs.values_mut().chain(executions.values_mut()) {
            slot.cancel();
        }
        jobs.clear();
        executions.clear();
        info!("调度实例已停止");
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// 调度作业定义；同一 (code, group) 已存在时拒绝并记录，不覆盖
    pub async fn schedule(&self, definition: JobDefinition) -> bool {
        let key = definition.key();
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&key) {
            warn!("作业 {} 已在本地调度，忽略重复的调度请求", key);
            return false;
        }

        let entries = self.engine.create_triggers(&definition);
        if entries.is_empty() {
            warn!("作业 {} 没有可用的触发器", key);
        }
        let slot = self.new_slot(
            ScheduledJob {
                definition,
                execution: None,
            },
            entries,
            false,
            state.running,
        );
        info!("调度作业 {}: 触发器 {:?}", key, slot.trigger_keys());
        state.jobs.insert(key, slot);
        true
    }

    /// 替换已调度作业的触发器并刷新定义快照；作业不存在时记录并忽略
    pub async fn reschedule(&self, definition: JobDefinition) -> bool {
        let key = definition.key();
        let mut state = self.state.lock().await;
        let running = state.running;
        let Some(slot) = state.jobs.get_mut(&key) else {
            warn!("重新调度的作业 {} 不存在，已忽略", key);
            return false;
        };

        slot.cancel();
        slot.entries = self.engine.create_triggers(&definition);
        slot.job = Arc::new(ScheduledJob {
            definition,
            execution: None,
        });
        if running {
            slot.task = Some(self.spawn_loop(slot));
        }
        info!("重新调度作业 {}: 触发器 {:?}", key, slot.trigger_keys());
        true
    }

    /// 取消作业的全部触发器并移除；作业不存在时不做任何事
    pub async fn unschedule(&self, code: &str, group: &str) -> bool {
        let key = JobKey::new(code, group);
        let mut state = self.state.lock().await;
        match state.jobs.remove(&key) {
            Some(mut slot) => {
                slot.cancel();
                info!("取消调度作业 {}", key);
                true
            }
            None => {
                debug!("取消调度的作业 {} 不存在，已忽略", key);
                false
            }
        }
    }

    /// 指定分组与类型下本地作业的 code -> 最后修改时间
    pub async fn status(&self, group: &str, job_type: &str) -> HashMap<String, DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .map(|slot| &slot.job.definition)
            .filter(|d| d.group == group && d.job_type == job_type)
            .map(|d| (d.code.clone(), d.modified_at))
            .collect()
    }

    /// 本地已调度作业所属的分组
    pub async fn groups(&self) -> BTreeSet<String> {
        let state = self.state.lock().await;
        state.jobs.keys().map(|k| k.group.clone()).collect()
    }

    pub async fn codes_in_group(&self, group: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut codes: Vec<_> = state
            .jobs
            .keys()
            .filter(|k| k.group == group)
            .map(|k| k.code.clone())
            .collect();
        codes.sort();
        codes
    }

    pub async fn contains(&self, code: &str, group: &str) -> bool {
        self.state
            .lock()
            .await
            .jobs
            .contains_key(&JobKey::new(code, group))
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn trigger_keys(&self, code: &str, group: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .jobs
            .get(&JobKey::new(code, group))
            .map(Slot::trigger_keys)
            .unwrap_or_default()
    }

    pub async fn definition(&self, code: &str, group: &str) -> Option<JobDefinition> {
        self.state
            .lock()
            .await
            .jobs
            .get(&JobKey::new(code, group))
            .map(|slot| slot.job.definition.clone())
    }

    /// 调度执行实例；没有可用触发器时立即触发一次
    pub async fn schedule_execution(&self, execution: JobExecution) -> bool {
        let key = execution.key();
        let mut state = self.state.lock().await;
        if state.executions.contains_key(&key) {
            warn!("执行实例 {} 已在本地调度，忽略重复的调度请求", key);
            return false;
        }

        let now = Utc::now();
        let mut entries =
            self.engine
                .create_triggers_at(&execution.definition, Some(&execution.payload), now);
        if entries.is_empty() {
            debug!("执行实例 {} 没有可用的触发器，立即触发一次", key);
            entries.push(
                self.engine
                    .immediate(&execution.definition, Some(&execution.payload), now),
            );
        }

        let paused = execution.status == ExecutionStatus::Paused;
        let definition = execution.definition.clone();
        let slot = self.new_slot(
            ScheduledJob {
                definition,
                execution: Some(execution),
            },
            entries,
            paused,
            state.running,
        );
        info!("调度执行实例 {} (暂停: {})", key, paused);
        state.executions.insert(key, slot);
        true
    }

    pub async fn pause_execution(&self, key: &ExecutionKey) -> bool {
        self.set_paused(key, true).await
    }

    pub async fn resume_execution(&self, key: &ExecutionKey) -> bool {
        self.set_paused(key, false).await
    }

    pub async fn unschedule_execution(&self, key: &ExecutionKey) -> bool {
        let mut state = self.state.lock().await;
        match state.executions.remove(key) {
            Some(mut slot) => {
                slot.cancel();
                info!("取消调度执行实例 {}", key);
                true
            }
            None => {
                debug!("取消调度的执行实例 {} 不存在，已忽略", key);
                false
            }
        }
    }

    pub async fn contains_execution(&self, key: &ExecutionKey) -> bool {
        self.state.lock().await.executions.contains_key(key)
    }

    pub async fn execution_count(&self) -> usize {
        self.state.lock().await.executions.len()
    }

    pub async fn is_paused(&self, key: &ExecutionKey) -> Option<bool> {
        self.state
            .lock()
            .await
            .executions
            .get(key)
            .map(|slot| *slot.paused.borrow())
    }

    /// 在同一把锁下读取全部执行实例的调度与暂停状态
    pub async fn execution_snapshot(&self) -> ExecutionSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = ExecutionSnapshot::default();
        for (key, slot) in &state.executions {
            if *slot.paused.borrow() {
                snapshot.paused.insert(key.clone());
            }
            snapshot.known.insert(key.clone());
        }
        snapshot
    }

    async fn set_paused(&self, key: &ExecutionKey, paused: bool) -> bool {
        let state = self.state.lock().await;
        match state.executions.get(key) {
            Some(slot) => {
                slot.paused.send_replace(paused);
                info!(
                    "执行实例 {} 已{}",
                    key,
                    if paused { "暂停" } else { "恢复" }
                );
                true
            }
            None => {
                debug!("执行实例 {} 不存在，忽略暂停/恢复", key);
                false
            }
        }
    }

    fn new_slot(
        &self,
        job: ScheduledJob,
        entries: Vec<ScheduleEntry>,
        paused: bool,
        running: bool,
    ) -> Slot {
        let mut slot = Slot {
            job: Arc::new(job),
            entries,
            paused: watch::channel(paused).0,
            task: None,
        };
        if running {
            slot.task = Some(self.spawn_loop(&slot));
        }
        slot
    }

    fn spawn_loop(&self, slot: &Slot) -> JoinHandle<()> {
        tokio::spawn(run_triggers(
            Arc::clone(&slot.job),
            slot.entries.clone(),
            slot.paused.subscribe(),
            Arc::clone(&self.handler),
        ))
    }
}

impl Drop for LocalScheduleInstance {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for slot in state
            .jobs
            .values_mut()
            .chain(state.executions.values_mut())
        {
            slot.cancel();
        }
    }
}

/// 单个调度条目的触发循环
///
/// 暂停期间重复触发器的到期触发被跳过；一次性触发等待恢复后再触发，
/// 执行实例的完成也只在恢复后上报。
async fn run_triggers(
    job: Arc<ScheduledJob>,
    entries: Vec<ScheduleEntry>,
    mut paused: watch::Receiver<bool>,
    handler: Arc<dyn FiringHandler>,
) {
    let mut pending: Vec<(ScheduleEntry, DateTime<Utc>)> = entries
        .into_iter()
        .filter_map(|entry| entry.first_fire_time().map(|at| (entry, at)))
        .collect();
    let tally = Arc::new(SharedTally::default());
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

    while let Some(index) = earliest(&pending) {
        let due = pending[index].1;
        let delay = (due - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
        tokio::time::sleep(delay).await;

        let now = Utc::now();
        let entry = &pending[index].0;
        let late = now - due;

        let is_paused = *paused.borrow();

        if entry.is_repeating() && late > Duration::milliseconds(MISFIRE_THRESHOLD_MS) {
            warn!(
                "{} 的触发器 {} 错过了 {} 的触发，跳到下一次",
                job.describe(),
                entry.key(),
                due
            );
        } else if entry.is_repeating() && is_paused {
            debug!("{} 已暂停，跳过 {} 的触发", job.describe(), due);
        } else {
            if is_paused {
                debug!("{} 已暂停，{} 的触发等待恢复", job.describe(), due);
                if paused.wait_for(|p| !*p).await.is_err() {
                    return;
                }
            }
            let firing = Firing {
                job: Arc::clone(&job),
                trigger_key: entry.key().to_string(),
                fire_time: due,
                payload: entry.payload().clone(),
            };
            let handler = Arc::clone(&handler);
            let tally = Arc::clone(&tally);
            in_flight.retain(|handle| !handle.is_finished());
            in_flight.push(tokio::spawn(async move {
                if let Some(status) = handler.fire(firing).await {
                    tally.record(status);
                }
            }));
        }

        let after = if entry.is_repeating() { now.max(due) } else { due };
        match entry.next_fire_after(after) {
            Some(next) => pending[index].1 = next,
            None => {
                debug!("{} 的触发器 {} 已耗尽", job.describe(), entry.key());
                pending.swap_remove(index);
            }
        }
    }

    if job.execution.is_some() {
        futures::future::join_all(in_flight).await;
        if *paused.borrow() {
            debug!("{} 的触发器已耗尽，等待恢复后上报完成", job.describe());
        }
        if paused.wait_for(|p| !*p).await.is_err() {
            return;
        }
        handler.exhausted(job, tally.snapshot()).await;
    }
}

fn earliest(pending: &[(ScheduleEntry, DateTime<Utc>)]) -> Option<usize> {
    pending
        .iter()
        .enumerate()
        .min_by_key(|(_, (_, at))| *at)
        .map(|(index, _)| index)
}
