pub mod core;
pub mod error;
pub mod config;
pub mod queue;
pub mod pool;
pub mod mix;
pub mod limits;
pub mod coordinator;
pub mod blame;
pub mod provenance;
pub mod chain;
pub mod notify;
pub mod storage;
pub mod metrics;
pub mod rpc;

pub use core::types::*;
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, CoordinatorResult, ErrorCode};
