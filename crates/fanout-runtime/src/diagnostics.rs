//! Periodic runtime diagnostics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;

/// Logs live invocation count and pool occupancy at a fixed interval.
///
/// Runs beside the orchestrator, never inside its control flow. Started and
/// stopped explicitly.
pub struct Diagnostics {
  cancel: CancellationToken,
  samples: Arc<AtomicU64>,
  task: JoinHandle<()>,
}

impl Diagnostics {
  pub fn start(orchestrator: Orchestrator, interval: Duration) -> Self {
    let interval = interval.max(Duration::from_millis(1));
    let cancel = CancellationToken::new();
    let samples = Arc::new(AtomicU64::new(0));

    let token = cancel.clone();
    let counter = samples.clone();
    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = ticker.tick() => match orchestrator.snapshot().await {
            Ok(snapshot) => {
              counter.fetch_add(1, Ordering::SeqCst);
              info!(
                live_invocations = snapshot.live_invocations,
                tracked_submissions = snapshot.tracked_submissions,
                pool_capacity = snapshot.pool.capacity,
                pool_in_use = snapshot.pool.in_use,
                pool_queued = snapshot.pool.queued,
                "diagnostics"
              );
            }
            Err(err) => warn!(error = %err, "diagnostics snapshot failed"),
          },
        }
      }
    });

    info!(?interval, "diagnostics started");
    Self {
      cancel,
      samples,
      task,
    }
  }

  /// Number of snapshots logged so far.
  pub fn samples(&self) -> u64 {
    self.samples.load(Ordering::SeqCst)
  }

  pub async fn stop(self) {
    self.cancel.cancel();
    if let Err(err) = self.task.await {
      warn!(error = %err, "diagnostics task ended abnormally");
    }
    info!("diagnostics stopped");
  }
}
