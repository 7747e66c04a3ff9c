//! In-process synchronous pool.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::blocking::panic_message;
use crate::error::{PoolError, PoolFault};
use crate::fatal::FatalSink;
use crate::{PoolJob, PoolStats, WorkerPool};

/// Runs each job directly on the calling thread.
///
/// There is no queue and no thread hop: `run` blocks until the job returns.
/// Meant for tests that want deterministic, single-threaded activity
/// execution. The start-to-close bound is checked after the job returns.
#[derive(Default)]
pub struct InlinePool {
  fatal: FatalSink,
  in_use: AtomicUsize,
}

impl InlinePool {
  pub fn new(fatal: FatalSink) -> Self {
    Self {
      fatal,
      in_use: AtomicUsize::new(0),
    }
  }
}

#[async_trait]
impl WorkerPool for InlinePool {
  async fn run(
    &self,
    job: PoolJob,
    cancel: CancellationToken,
  ) -> Result<serde_json::Value, PoolError> {
    if self.fatal.is_tripped() {
      return Err(PoolError::Unavailable);
    }
    if cancel.is_cancelled() {
      return Err(PoolError::Cancelled);
    }

    let PoolJob {
      name,
      work,
      start_to_close,
    } = job;

    self.in_use.fetch_add(1, Ordering::SeqCst);
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(work));
    let elapsed = started.elapsed();
    self.in_use.fetch_sub(1, Ordering::SeqCst);

    match outcome {
      Ok(result) => match start_to_close {
        Some(limit) if elapsed > limit => Err(PoolError::Timeout { after: limit }),
        _ => result.map_err(PoolError::Job),
      },
      Err(payload) => {
        let fault = PoolFault {
          job: name,
          message: panic_message(payload),
        };
        self.fatal.report(fault.clone());
        Err(PoolError::Fault(fault))
      }
    }
  }

  fn stats(&self) -> PoolStats {
    PoolStats {
      capacity: 1,
      in_use: self.in_use.load(Ordering::SeqCst),
      queued: 0,
    }
  }

  fn fatal_sink(&self) -> &FatalSink {
    &self.fatal
  }
}
