//! # Scheduler Testing Utils
//!
//! 工作区共享的测试工具：脚本化的控制器通道、实体构建器和内存版数据仓储。
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod in_memory;
pub mod mocks;

pub use builders::*;
pub use in_memory::InMemoryRepository;
pub use mocks::*;
