pub mod channel;
pub mod entities;
pub mod messaging;
pub mod repositories;

pub use channel::ControllerChannel;
pub use entities::*;
pub use messaging::*;
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
