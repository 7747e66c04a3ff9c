//! Runtime errors.

use std::fmt;
use std::time::Duration;

use fanout_pool::{PoolError, PoolFault};
use fanout_workflow::{ChildKind, InvocationId, InvocationStatus, WorkflowError};

/// Which deadline an invocation ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
  /// Total wall-clock bound across all attempts.
  Execution,
  /// Bound on a single attempt.
  Run,
  /// Bound on one activity execution, from slot lease to return.
  StartToClose,
}

impl fmt::Display for TimeoutKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TimeoutKind::Execution => f.write_str("execution"),
      TimeoutKind::Run => f.write_str("run"),
      TimeoutKind::StartToClose => f.write_str("start-to-close"),
    }
  }
}

/// Terminal failure of one invocation.
///
/// Cloneable so that every awaiter of a submission sees the same error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvocationError {
  /// A deadline expired.
  #[error("invocation '{id}' exceeded its {kind} timeout of {after:?}")]
  Timeout {
    id: InvocationId,
    kind: TimeoutKind,
    after: Duration,
  },

  /// A child failed at the join barrier. Identifies the first failed child
  /// in fan-out order.
  #[error("{kind} child {index} ('{invocation_id}') failed")]
  ChildFailed {
    kind: ChildKind,
    index: u32,
    invocation_id: InvocationId,
    /// Failed children besides the reported one.
    other_failures: usize,
    #[source]
    source: Box<InvocationError>,
  },

  /// The invocation was cancelled, explicitly or by its parent.
  #[error("invocation '{id}' was cancelled")]
  Cancelled { id: InvocationId },

  /// A leaf activity returned an error.
  #[error("activity '{id}' failed: {message}")]
  Activity { id: InvocationId, message: String },

  /// The worker pool crashed while running a child of this invocation.
  #[error(transparent)]
  PoolFault(PoolFault),

  /// The worker pool refused work after an earlier fault.
  #[error("worker pool unavailable")]
  PoolUnavailable,

  /// The invocation store rejected an update.
  #[error("invocation store error: {message}")]
  Store { message: String },

  /// The invocation task ended without producing a result.
  #[error("internal error: {message}")]
  Internal { message: String },
}

impl InvocationError {
  /// Map a pool error for the activity `id`.
  pub fn from_pool(id: &InvocationId, err: PoolError) -> Self {
    match err {
      PoolError::Job(e) => InvocationError::Activity {
        id: id.clone(),
        message: e.message,
      },
      PoolError::Timeout { after } => InvocationError::Timeout {
        id: id.clone(),
        kind: TimeoutKind::StartToClose,
        after,
      },
      PoolError::Cancelled => InvocationError::Cancelled { id: id.clone() },
      PoolError::Fault(fault) => InvocationError::PoolFault(fault),
      PoolError::Unavailable => InvocationError::PoolUnavailable,
    }
  }

  /// Status recorded for an invocation ending with this error.
  pub fn terminal_status(&self) -> InvocationStatus {
    match self {
      InvocationError::Timeout { .. } => InvocationStatus::TimedOut,
      _ => InvocationStatus::Failed,
    }
  }

  /// Whether another attempt could succeed.
  pub fn is_retryable(&self) -> bool {
    match self {
      InvocationError::Timeout { .. } | InvocationError::Activity { .. } => true,
      InvocationError::ChildFailed { source, .. } => source.is_retryable(),
      InvocationError::Cancelled { .. }
      | InvocationError::PoolFault(_)
      | InvocationError::PoolUnavailable
      | InvocationError::Store { .. }
      | InvocationError::Internal { .. } => false,
    }
  }

  /// The pool fault behind this error, however deep in the child chain.
  pub fn pool_fault(&self) -> Option<&PoolFault> {
    match self {
      InvocationError::PoolFault(fault) => Some(fault),
      InvocationError::ChildFailed { source, .. } => source.pool_fault(),
      _ => None,
    }
  }

  /// This error and all of its sources, joined with `: `.
  pub fn chain(&self) -> String {
    let mut message = self.to_string();
    let mut source = std::error::Error::source(self);
    while let Some(cause) = source {
      message.push_str(": ");
      message.push_str(&cause.to_string());
      source = cause.source();
    }
    message
  }

  /// The innermost cause, following failed children down.
  pub fn root_cause(&self) -> &InvocationError {
    match self {
      InvocationError::ChildFailed { source, .. } => source.root_cause(),
      other => other,
    }
  }
}

impl From<StoreError> for InvocationError {
  fn from(err: StoreError) -> Self {
    InvocationError::Store {
      message: err.to_string(),
    }
  }
}

/// Errors of the invocation store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
  #[error("invocation '{id}' not found")]
  NotFound { id: InvocationId },

  #[error("invocation '{id}' is already live")]
  AlreadyExists { id: InvocationId },

  #[error("invocation '{id}' is {status} and cannot be archived yet")]
  NotTerminal {
    id: InvocationId,
    status: InvocationStatus,
  },

  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  #[error("store lock poisoned")]
  Poisoned,
}

/// Errors of submission-level operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
  /// The orchestrator was shut down.
  #[error("orchestrator is shutting down")]
  ShuttingDown,

  /// The pool faulted earlier; the process takes no more work.
  #[error("worker pool faulted, no further submissions are accepted")]
  PoolFaulted(#[source] PoolFault),

  /// No submission with this id.
  #[error("invocation '{0}' not found")]
  NotFound(InvocationId),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("submission table lock poisoned")]
  Poisoned,
}

/// Errors seen by a transport client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error(transparent)]
  Submission(#[from] OrchestratorError),

  #[error(transparent)]
  Invocation(#[from] InvocationError),
}

/// Errors ending the worker loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  #[error("worker stopped after a fatal pool fault")]
  PoolFault(#[source] PoolFault),
}

#[cfg(test)]
mod tests {
  use super::*;

  fn child_failed(source: InvocationError) -> InvocationError {
    InvocationError::ChildFailed {
      kind: ChildKind::Task,
      index: 0,
      invocation_id: InvocationId::new("root-task-0"),
      other_failures: 0,
      source: Box::new(source),
    }
  }

  #[test]
  fn test_timeout_maps_to_timed_out() {
    let err = InvocationError::Timeout {
      id: InvocationId::new("a"),
      kind: TimeoutKind::Run,
      after: Duration::from_secs(60),
    };
    assert_eq!(err.terminal_status(), InvocationStatus::TimedOut);
    assert!(err.is_retryable());
  }

  #[test]
  fn test_child_failure_is_failed_not_timed_out() {
    let err = child_failed(InvocationError::Timeout {
      id: InvocationId::new("root-task-0"),
      kind: TimeoutKind::Run,
      after: Duration::from_secs(60),
    });
    assert_eq!(err.terminal_status(), InvocationStatus::Failed);
    assert!(matches!(err.root_cause(), InvocationError::Timeout { .. }));
  }

  #[test]
  fn test_chain_includes_child_cause() {
    let err = child_failed(InvocationError::Activity {
      id: InvocationId::new("root-task-0-activity-0"),
      message: "boom".to_string(),
    });
    assert_eq!(
      err.chain(),
      "task child 0 ('root-task-0') failed: activity 'root-task-0-activity-0' failed: boom"
    );
  }

  #[test]
  fn test_pool_fault_is_never_retried() {
    let fault = PoolFault {
      job: "x".to_string(),
      message: "crash".to_string(),
    };
    let err = child_failed(InvocationError::PoolFault(fault.clone()));
    assert!(!err.is_retryable());
    assert_eq!(err.pool_fault(), Some(&fault));
  }

  #[test]
  fn test_cancelled_is_not_retryable() {
    let err = InvocationError::Cancelled {
      id: InvocationId::new("a"),
    };
    assert!(!err.is_retryable());
  }

  #[test]
  fn test_from_pool_timeout_is_start_to_close() {
    let id = InvocationId::new("root-activity-1");
    let err = InvocationError::from_pool(
      &id,
      PoolError::Timeout {
        after: Duration::from_secs(600),
      },
    );
    assert!(matches!(
      err,
      InvocationError::Timeout {
        kind: TimeoutKind::StartToClose,
        ..
      }
    ));
  }
}
