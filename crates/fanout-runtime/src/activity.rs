//! Leaf activities.

use std::sync::Arc;
use std::time::Duration;

use fanout_pool::{JobError, PoolJob};
use fanout_workflow::{ACTIVITY_NAME, InvocationId, TaskInput};
use tracing::info;

/// Synchronous leaf work, run on a pool slot.
///
/// Implementations get their own copy of the input and nothing else. They
/// may block: the slot is theirs until they return.
pub trait LeafActivity: Send + Sync + 'static {
  fn execute(&self, id: &InvocationId, input: &TaskInput) -> Result<f64, JobError>;
}

/// Blocks for the input delay and returns it in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepActivity;

impl LeafActivity for SleepActivity {
  fn execute(&self, id: &InvocationId, input: &TaskInput) -> Result<f64, JobError> {
    info!(
      invocation_id = %id,
      activity = ACTIVITY_NAME,
      "sleeping for {}s",
      input.delay.as_secs_f64()
    );
    std::thread::sleep(input.delay);
    Ok(delay_millis(input.delay))
  }
}

/// `1000 × delay`, the value a leaf activity reports.
pub fn delay_millis(delay: Duration) -> f64 {
  delay.as_secs_f64() * 1000.0
}

/// Package one activity execution as a pool job.
pub(crate) fn activity_job(
  activity: Arc<dyn LeafActivity>,
  id: &InvocationId,
  input: TaskInput,
  start_to_close: Duration,
) -> PoolJob {
  let job_id = id.clone();
  PoolJob::new(id.to_string(), move || {
    activity
      .execute(&job_id, &input)
      .map(|millis| serde_json::json!(millis))
  })
  .with_start_to_close(start_to_close)
}

#[cfg(test)]
mod tests {
  use fanout_pool::{FatalSink, InlinePool, WorkerPool};
  use tokio_util::sync::CancellationToken;

  use super::*;

  #[test]
  fn test_sleep_activity_reports_millis() {
    let input = TaskInput::new("hello", 0.02, 0, 0).unwrap();
    let millis = SleepActivity
      .execute(&InvocationId::new("a"), &input)
      .unwrap();
    assert!((millis - 20.0).abs() < 1e-9);
  }

  #[test]
  fn test_delay_millis() {
    assert_eq!(delay_millis(Duration::from_secs(5)), 5000.0);
    assert_eq!(delay_millis(Duration::from_millis(1500)), 1500.0);
  }

  #[tokio::test]
  async fn test_activity_job_runs_on_pool() {
    let pool = InlinePool::new(FatalSink::new());
    let input = TaskInput::new("hello", 0.0, 0, 0).unwrap();
    let job = activity_job(
      Arc::new(SleepActivity),
      &InvocationId::new("p-activity-0"),
      input,
      Duration::from_secs(600),
    );
    assert_eq!(job.name, "p-activity-0");

    let value = pool.run(job, CancellationToken::new()).await.unwrap();
    assert_eq!(value, serde_json::json!(0.0));
  }
}
