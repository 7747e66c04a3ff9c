use thiserror::Error;

use crate::invocation::{ChildKind, InvocationStatus};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
  #[error("invalid delay {delay_secs}s: expected a finite, non-negative number of seconds")]
  InvalidDelay { delay_secs: f64 },

  #[error("invocation '{id}' cannot move from {from} to {to}")]
  InvalidTransition {
    id: String,
    from: InvocationStatus,
    to: InvocationStatus,
  },

  #[error("invocation '{id}' is already {status} and cannot start another attempt")]
  AttemptAfterTerminal { id: String, status: InvocationStatus },

  #[error("invocation '{id}' has no {kind} child at index {index}")]
  ChildNotFound {
    id: String,
    kind: ChildKind,
    index: u32,
  },
}
