pub mod components;
pub mod context;
pub mod controller;
pub mod cron_utils;
pub mod execution_reconciler;
pub mod executor_registry;
pub mod executors;
pub mod publisher;
pub mod runner;
pub mod schedule_instance;
pub mod sync_protocol;
pub mod trigger_engine;

pub use components::{HeartbeatManager, HttpChannel, WorkerLifecycle};
pub use context::{JobContext, Modules, OutputSink, PayloadReader};
pub use controller::{WorkerController, WorkerControllerBuilder};
pub use cron_utils::{CronScheduler, TriggerZone};
pub use execution_reconciler::{classify, Classification, ExecutionIndexReconciler, ReconcileReport};
pub use executor_registry::{Executor, ExecutorFactory, ExecutorRegistry, ExecutorRegistryBuilder};
pub use executors::{HttpExecutor, HttpTaskParams, ShellExecutor, ShellTaskParams};
pub use publisher::{SubscriptionId, UpdatePublisher};
pub use runner::{ClusterLock, ExclusiveLock, JobRunner};
pub use schedule_instance::{
    ExecutionSnapshot, Firing, FiringHandler, FiringTally, LocalScheduleInstance, ScheduledJob,
};
pub use sync_protocol::{SyncProtocol, SyncReport};
pub use trigger_engine::{ScheduleEntry, TriggerEngine};
