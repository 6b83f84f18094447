//! Commands and their execution.
//!
//! - **`model`**: commands, requests and per-command results
//! - **`processor`**: validates commands against the current aggregate state and appends events
//! - **`bus`**: queued execution with a broadcast result stream
//!
//! Both the processor and the bus implement [`CommandExecutor`], so the title
//! policy and the synchronizer can run against either.

pub mod bus;
pub mod model;
pub mod processor;

pub use bus::{CommandBus, DEFAULT_BUS_CAPACITY, DEFAULT_RESULT_TIMEOUT};
pub use model::*;
pub use processor::{CommandProcessor, DEFAULT_LOCK_STRIPES};

use async_trait::async_trait;

/// Something that executes command requests and reports their outcome.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute the request's commands in order, stopping at the first failure.
    ///
    /// Each command after the first is checked against the revision produced
    /// by the one before it.
    async fn execute(&self, request: CommandRequest) -> CommandResult;
}
