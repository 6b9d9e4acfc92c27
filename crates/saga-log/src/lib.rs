//! Durable, append-only step log.
//!
//! The log is the only authoritative record of a saga instance. Every forward
//! and compensating attempt, status transition and cancellation request is
//! appended here before the engine acts on it, so the full orchestration
//! state can be rebuilt from `read_history` alone after a restart.

mod error;
mod file;
mod memory;
mod traits;

pub use error::{LogError, LogWriteError};
pub use file::FileStepLog;
pub use memory::MemoryStepLog;
pub use traits::StepLog;

pub type Result<T> = std::result::Result<T, LogError>;
