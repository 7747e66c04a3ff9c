//! Fanout Workflow
//!
//! This crate holds the data model shared by the orchestrator, the worker pool
//! and the CLI:
//! - [`TaskInput`] / [`TaskOutput`]: the payloads of one task invocation
//! - [`RetryPolicy`] and the fan-out timeouts applied to every child edge
//! - [`TaskInvocation`] / [`ChildRef`]: the record of a running invocation and
//!   the children it is waiting on
//!
//! Nothing here performs I/O. Scheduling lives in `fanout-runtime`.

mod error;
mod input;
mod invocation;
mod policy;

pub use error::WorkflowError;
pub use input::{TaskInput, TaskOutput, secs};
pub use invocation::{
  ChildKind, ChildRef, ChildResult, InvocationId, InvocationStatus, TaskInvocation,
};
pub use policy::{
  ACTIVITY_NAME, ACTIVITY_TIMEOUT, CHILD_TASK_TIMEOUT, DEFAULT_EXECUTION_TIMEOUT, RetryPolicy,
  TASK_NAME,
};
