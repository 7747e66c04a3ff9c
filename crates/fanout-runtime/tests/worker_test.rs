//! The worker serving loop against real pools.

use std::sync::Arc;

use fanout_pool::{BlockingPool, FatalSink, JobError, WorkerPool};
use fanout_runtime::{
  InvocationError, LeafActivity, Orchestrator, Submission, Worker, WorkerError, delay_millis,
};
use fanout_workflow::{InvocationId, TaskInput};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct InstantActivity;

impl LeafActivity for InstantActivity {
  fn execute(&self, _id: &InvocationId, input: &TaskInput) -> Result<f64, JobError> {
    Ok(delay_millis(input.delay))
  }
}

struct PanickingActivity;

impl LeafActivity for PanickingActivity {
  fn execute(&self, _id: &InvocationId, _input: &TaskInput) -> Result<f64, JobError> {
    panic!("worker process died")
  }
}

fn blocking_orchestrator(activity: Arc<dyn LeafActivity>) -> Orchestrator {
  let pool: Arc<dyn WorkerPool> = Arc::new(BlockingPool::new(1, FatalSink::new()));
  Orchestrator::builder(pool).activity(activity).build()
}

#[tokio::test]
async fn test_worker_serves_until_senders_are_gone() {
  let (tx, mut rx) = mpsc::unbounded_channel();
  let worker = Worker::new(blocking_orchestrator(Arc::new(InstantActivity))).with_reports(tx);
  let sender = worker.sender();

  let input = TaskInput::new("hello world", 0.01, 2, 3).unwrap();
  sender
    .send(Submission::new(input.clone()).with_id("job-1"))
    .await
    .unwrap();
  // Same id again: shares the first result
  sender
    .send(Submission::new(input).with_id("job-1"))
    .await
    .unwrap();
  drop(sender);

  worker.start(CancellationToken::new()).await.unwrap();

  let mut reports = Vec::new();
  while let Ok(report) = rx.try_recv() {
    reports.push(report);
  }
  assert_eq!(reports.len(), 2);
  for report in reports {
    assert_eq!(report.id.as_str(), "job-1");
    assert_eq!(report.result.unwrap().text, "0.01s later...");
  }
}

#[tokio::test]
async fn test_worker_exits_on_pool_fault() {
  let (tx, mut rx) = mpsc::unbounded_channel();
  let orchestrator = blocking_orchestrator(Arc::new(PanickingActivity));
  let worker = Worker::new(orchestrator.clone()).with_reports(tx);
  let sender = worker.sender();

  let input = TaskInput::new("hello world", 0.0, 0, 1).unwrap();
  sender.send(Submission::new(input)).await.unwrap();

  let err = worker.start(CancellationToken::new()).await.unwrap_err();
  match err {
    WorkerError::PoolFault(fault) => assert!(fault.message.contains("worker process died")),
  }
  assert!(orchestrator.is_shut_down());

  let report = rx.try_recv().unwrap();
  let failure = report.result.unwrap_err();
  assert!(matches!(
    failure.root_cause(),
    InvocationError::PoolFault(_)
  ));
  drop(sender);
}
