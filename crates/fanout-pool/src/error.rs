//! Pool errors.

use std::time::Duration;

/// Error returned by a job body. Recoverable: it fails the one job only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
  pub message: String,
}

impl JobError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// An unrecoverable failure inside the pool: the execution context of a job
/// died instead of returning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pool fault in job '{job}': {message}")]
pub struct PoolFault {
  pub job: String,
  pub message: String,
}

/// Errors returned by [`crate::WorkerPool::run`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
  /// The job body returned an error.
  #[error("job failed: {0}")]
  Job(#[from] JobError),

  /// The job did not finish within its start-to-close bound.
  #[error("job timed out after {after:?}")]
  Timeout { after: Duration },

  /// The caller cancelled the job.
  #[error("job cancelled")]
  Cancelled,

  /// The job's execution context crashed.
  #[error(transparent)]
  Fault(PoolFault),

  /// The pool has faulted before and takes no more work.
  #[error("worker pool is unavailable after a fatal fault")]
  Unavailable,
}
