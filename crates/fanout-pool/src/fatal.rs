//! Process-wide sink for fatal pool faults.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::PoolFault;

/// Receives fatal faults from every pool in the process.
///
/// Only the first fault is kept and logged; concurrent and later reports are
/// dropped. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct FatalSink {
  inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
  fault: OnceLock<PoolFault>,
  tripped: CancellationToken,
}

impl FatalSink {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a fault. Returns `true` if this call was the one that tripped the
  /// sink.
  pub fn report(&self, fault: PoolFault) -> bool {
    match self.inner.fault.set(fault) {
      Ok(()) => {
        if let Some(fault) = self.inner.fault.get() {
          error!(job = %fault.job, error = %fault.message, "pool_fault");
        }
        self.inner.tripped.cancel();
        true
      }
      Err(dropped) => {
        debug!(job = %dropped.job, "pool fault already reported, dropping");
        false
      }
    }
  }

  pub fn is_tripped(&self) -> bool {
    self.inner.fault.get().is_some()
  }

  /// The recorded fault, if any.
  pub fn fault(&self) -> Option<PoolFault> {
    self.inner.fault.get().cloned()
  }

  /// Resolve once a fault has been reported.
  pub async fn wait(&self) -> PoolFault {
    loop {
      if let Some(fault) = self.fault() {
        return fault;
      }
      self.inner.tripped.cancelled().await;
    }
  }
}
