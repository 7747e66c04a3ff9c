//! Slot-bounded pool running jobs on tokio's blocking threads.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{PoolError, PoolFault};
use crate::fatal::FatalSink;
use crate::{PoolJob, PoolStats, WorkerPool};

/// A pool with a fixed number of execution slots.
///
/// Jobs wait in FIFO order for a slot, then run on a dedicated blocking thread
/// that holds the slot until the job body returns. With a capacity of 1 jobs
/// run strictly one after another.
pub struct BlockingPool {
  capacity: usize,
  slots: Arc<Semaphore>,
  queued: AtomicUsize,
  fatal: FatalSink,
}

impl BlockingPool {
  /// Create a pool with `capacity` slots (at least one).
  pub fn new(capacity: usize, fatal: FatalSink) -> Self {
    let capacity = capacity.max(1);
    Self {
      capacity,
      slots: Arc::new(Semaphore::new(capacity)),
      queued: AtomicUsize::new(0),
      fatal,
    }
  }
}

#[async_trait]
impl WorkerPool for BlockingPool {
  #[instrument(name = "pool_run", skip_all, fields(job = %job.name))]
  async fn run(
    &self,
    job: PoolJob,
    cancel: CancellationToken,
  ) -> Result<serde_json::Value, PoolError> {
    if self.fatal.is_tripped() {
      return Err(PoolError::Unavailable);
    }

    self.queued.fetch_add(1, Ordering::SeqCst);
    let permit = tokio::select! {
      permit = self.slots.clone().acquire_owned() => permit,
      _ = cancel.cancelled() => {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        debug!("cancelled while queued");
        return Err(PoolError::Cancelled);
      }
    };
    self.queued.fetch_sub(1, Ordering::SeqCst);
    let permit = permit.map_err(|_| PoolError::Unavailable)?;

    if self.fatal.is_tripped() {
      return Err(PoolError::Unavailable);
    }

    let PoolJob {
      name,
      work,
      start_to_close,
    } = job;
    debug!("slot leased");

    // The supervisor outlives the caller on timeout or cancellation so that a
    // crash of the detached job is still reported.
    let fatal = self.fatal.clone();
    let supervisor = tokio::spawn(async move {
      let handle = tokio::task::spawn_blocking(move || {
        let _slot = permit;
        work()
      });
      match handle.await {
        Ok(result) => result.map_err(PoolError::Job),
        Err(join_error) => {
          let message = if join_error.is_panic() {
            panic_message(join_error.into_panic())
          } else {
            join_error.to_string()
          };
          let fault = PoolFault { job: name, message };
          fatal.report(fault.clone());
          Err(PoolError::Fault(fault))
        }
      }
    });

    let deadline = async {
      match start_to_close {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
      }
    };

    // A finished job wins over a deadline or cancellation seen in the same poll
    tokio::select! {
      biased;
      joined = supervisor => joined.unwrap_or(Err(PoolError::Unavailable)),
      _ = deadline => {
        let after = start_to_close.unwrap_or_default();
        warn!(?after, "job exceeded start-to-close, slot stays leased until it returns");
        Err(PoolError::Timeout { after })
      }
      _ = cancel.cancelled() => {
        debug!("cancelled while running, slot stays leased until the job returns");
        Err(PoolError::Cancelled)
      }
    }
  }

  fn stats(&self) -> PoolStats {
    PoolStats {
      capacity: self.capacity,
      in_use: self.capacity - self.slots.available_permits(),
      queued: self.queued.load(Ordering::SeqCst),
    }
  }

  fn fatal_sink(&self) -> &FatalSink {
    &self.fatal
  }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "job panicked".to_string()
  }
}
