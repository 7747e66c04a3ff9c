//! Fanout Pool
//!
//! Execution substrate for leaf activities. A [`WorkerPool`] runs blocking
//! jobs on a fixed number of execution slots and queues whatever does not fit.
//!
//! ```text
//! WorkerPool
//! ├── BlockingPool - N slots, FIFO queue, jobs on tokio's blocking threads
//! └── InlinePool   - runs the job on the caller's thread (tests, debugging)
//!
//! FatalSink - one per process; the first PoolFault wins, later ones are dropped
//! ```
//!
//! A job that returns an error is the caller's problem ([`PoolError::Job`]).
//! A job that panics is a [`PoolFault`]: it is reported to the [`FatalSink`]
//! and the pool stops accepting work.

mod blocking;
mod error;
mod fatal;
mod inline;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use blocking::BlockingPool;
pub use error::{JobError, PoolError, PoolFault};
pub use fatal::FatalSink;
pub use inline::InlinePool;

/// Result of a job body.
pub type JobOutput = Result<serde_json::Value, JobError>;

/// A job body. Runs once, on whichever thread the pool picks.
pub type Job = Box<dyn FnOnce() -> JobOutput + Send + 'static>;

/// A unit of work submitted to a pool.
pub struct PoolJob {
  /// Label used in logs and fault reports.
  pub name: String,
  pub work: Job,
  /// Upper bound on run time, measured from the moment a slot is leased.
  pub start_to_close: Option<Duration>,
}

impl PoolJob {
  pub fn new<F>(name: impl Into<String>, work: F) -> Self
  where
    F: FnOnce() -> JobOutput + Send + 'static,
  {
    Self {
      name: name.into(),
      work: Box::new(work),
      start_to_close: None,
    }
  }

  pub fn with_start_to_close(mut self, limit: Duration) -> Self {
    self.start_to_close = Some(limit);
    self
  }
}

/// Point-in-time slot usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  pub capacity: usize,
  pub in_use: usize,
  pub queued: usize,
}

/// Bounded execution of blocking jobs.
#[async_trait]
pub trait WorkerPool: Send + Sync {
  /// Run `job` once a slot is free.
  ///
  /// Cancelling while queued removes the job from the queue. Cancelling or
  /// timing out while running returns immediately, but the slot stays leased
  /// until the job body actually returns.
  async fn run(
    &self,
    job: PoolJob,
    cancel: CancellationToken,
  ) -> Result<serde_json::Value, PoolError>;

  fn stats(&self) -> PoolStats;

  /// The sink this pool reports faults to.
  fn fatal_sink(&self) -> &FatalSink;
}
