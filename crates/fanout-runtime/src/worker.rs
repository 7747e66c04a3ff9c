//! Worker serving loop.
//!
//! The `Worker` owns an mpsc channel of submissions and hands each one to the
//! orchestrator, running them concurrently. It stops on cancellation, when
//! every sender is gone and in-flight work has drained, or on a pool fault.

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fanout_pool::FatalSink;
use fanout_workflow::InvocationId;

use crate::error::{OrchestratorError, WorkerError};
use crate::orchestrator::{InvocationHandle, InvocationResult, Orchestrator, Submission};

/// Terminal result of one submission handled by a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerReport {
  pub id: InvocationId,
  pub result: InvocationResult,
}

/// Serves submissions until stopped.
///
/// ```ignore
/// let worker = Worker::new(orchestrator);
/// let sender = worker.sender();
///
/// let cancel = CancellationToken::new();
/// worker.start(cancel).await?;
/// ```
pub struct Worker {
  sender: mpsc::Sender<Submission>,
  receiver: mpsc::Receiver<Submission>,
  orchestrator: Orchestrator,
  reports: Option<mpsc::UnboundedSender<WorkerReport>>,
}

impl Worker {
  pub fn new(orchestrator: Orchestrator) -> Self {
    Self::with_buffer_size(orchestrator, 100)
  }

  pub fn with_buffer_size(orchestrator: Orchestrator, buffer_size: usize) -> Self {
    let (sender, receiver) = mpsc::channel(buffer_size);
    Self {
      sender,
      receiver,
      orchestrator,
      reports: None,
    }
  }

  /// Deliver every terminal result to `reports`.
  pub fn with_reports(mut self, reports: mpsc::UnboundedSender<WorkerReport>) -> Self {
    self.reports = Some(reports);
    self
  }

  /// A sender for submissions. The loop ends once all senders are dropped.
  pub fn sender(&self) -> mpsc::Sender<Submission> {
    self.sender.clone()
  }

  /// Start the serving loop.
  ///
  /// Returns `Ok` after cancellation or once the channel closed and in-flight
  /// invocations finished. Returns [`WorkerError::PoolFault`] as soon as the
  /// pool faults; in-flight invocations are cancelled and drained first.
  pub async fn start(self, cancel: CancellationToken) -> Result<(), WorkerError> {
    let Worker {
      sender,
      mut receiver,
      orchestrator,
      reports,
    } = self;
    drop(sender);

    let fatal = orchestrator.fatal_sink().clone();
    info!(queue = %orchestrator.config().task_queue, "starting worker");

    let mut in_flight = JoinSet::new();
    let outcome = loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          info!("worker cancelled");
          orchestrator.shutdown();
          break Ok(());
        }
        fault = fatal.wait() => {
          orchestrator.shutdown();
          break Err(WorkerError::PoolFault(fault));
        }
        submission = receiver.recv() => match submission {
          Some(submission) => match orchestrator.submit(submission).await {
            Ok(handle) => {
              info!(invocation_id = %handle.id(), "invocation accepted");
              in_flight.spawn(report(handle, reports.clone()));
            }
            Err(OrchestratorError::PoolFaulted(fault)) => {
              orchestrator.shutdown();
              break Err(WorkerError::PoolFault(fault));
            }
            Err(err) => error!(error = %err, "submission rejected"),
          },
          None => {
            info!(in_flight = in_flight.len(), "worker channel closed, draining");
            break drain(&mut in_flight, &fatal, &cancel, &orchestrator).await;
          }
        },
        Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
      }
    };

    while in_flight.join_next().await.is_some() {}

    match &outcome {
      Ok(()) => info!("worker stopped"),
      Err(err) => error!(error = %err, "worker stopped"),
    }
    outcome
  }
}

/// Wait for in-flight invocations while still honouring cancellation and
/// pool faults.
async fn drain(
  in_flight: &mut JoinSet<()>,
  fatal: &FatalSink,
  cancel: &CancellationToken,
  orchestrator: &Orchestrator,
) -> Result<(), WorkerError> {
  loop {
    tokio::select! {
      joined = in_flight.join_next() => {
        if joined.is_none() {
          return Ok(());
        }
      }
      _ = cancel.cancelled() => {
        orchestrator.shutdown();
        return Ok(());
      }
      fault = fatal.wait() => {
        orchestrator.shutdown();
        return Err(WorkerError::PoolFault(fault));
      }
    }
  }
}

async fn report(handle: InvocationHandle, reports: Option<mpsc::UnboundedSender<WorkerReport>>) {
  let result = handle.result().await;
  debug!(invocation_id = %handle.id(), ok = result.is_ok(), "invocation finished");
  if let Some(reports) = reports {
    let _ = reports.send(WorkerReport {
      id: handle.id().clone(),
      result,
    });
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use fanout_pool::InlinePool;
  use fanout_workflow::TaskInput;

  use super::*;
  use crate::orchestrator::OrchestratorConfig;

  fn orchestrator() -> Orchestrator {
    Orchestrator::new(
      OrchestratorConfig::default(),
      Arc::new(InlinePool::new(FatalSink::new())),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_closed_channel_drains_then_stops() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = Worker::new(orchestrator()).with_reports(tx);
    let sender = worker.sender();

    for delay in [3.0, 1.0] {
      let input = TaskInput::new("hello world", delay, 0, 0).unwrap();
      sender.send(Submission::new(input)).await.unwrap();
    }
    drop(sender);

    worker.start(CancellationToken::new()).await.unwrap();

    let mut texts = Vec::new();
    while let Ok(report) = rx.try_recv() {
      texts.push(report.result.unwrap().text);
    }
    texts.sort();
    assert_eq!(texts, ["1.0s later...", "3.0s later..."]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_stops_and_cancels_in_flight() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = orchestrator();
    let worker = Worker::new(orchestrator.clone()).with_reports(tx);
    let sender = worker.sender();
    let cancel = CancellationToken::new();

    let running = tokio::spawn(worker.start(cancel.clone()));
    let input = TaskInput::new("hello world", 600.0, 0, 0).unwrap();
    sender.send(Submission::new(input)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    cancel.cancel();
    running.await.unwrap().unwrap();

    let report = rx.try_recv().unwrap();
    assert!(matches!(
      report.result,
      Err(crate::error::InvocationError::Cancelled { .. })
    ));
    assert!(orchestrator.is_shut_down());
  }
}
