pub mod controller_client;
pub mod heartbeat_manager;
pub mod worker_lifecycle;

pub use controller_client::HttpChannel;
pub use heartbeat_manager::HeartbeatManager;
pub use worker_lifecycle::WorkerLifecycle;
