//! The submit / await / cancel seam between clients and the orchestrator.

use async_trait::async_trait;

use fanout_workflow::{InvocationId, TaskOutput};

use crate::error::{OrchestratorError, TransportError};
use crate::orchestrator::{Orchestrator, Submission};

/// How a client reaches an orchestrator.
///
/// Submissions are idempotent by id. Awaiting the same id twice yields the
/// same result.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn submit(&self, submission: Submission) -> Result<InvocationId, OrchestratorError>;

  async fn await_result(&self, id: &InvocationId) -> Result<TaskOutput, TransportError>;

  async fn cancel(&self, id: &InvocationId) -> Result<(), OrchestratorError>;

  /// Submit and wait for the terminal result.
  async fn execute(&self, submission: Submission) -> Result<TaskOutput, TransportError> {
    let id = self.submit(submission).await?;
    self.await_result(&id).await
  }
}

/// In-process transport: the client and the orchestrator share a runtime.
#[async_trait]
impl Transport for Orchestrator {
  async fn submit(&self, submission: Submission) -> Result<InvocationId, OrchestratorError> {
    let handle = Orchestrator::submit(self, submission).await?;
    Ok(handle.id().clone())
  }

  async fn await_result(&self, id: &InvocationId) -> Result<TaskOutput, TransportError> {
    let handle = self.handle(id)?;
    Ok(handle.result().await?)
  }

  async fn cancel(&self, id: &InvocationId) -> Result<(), OrchestratorError> {
    Orchestrator::cancel(self, id)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use fanout_pool::{FatalSink, InlinePool};
  use fanout_workflow::TaskInput;

  use super::*;
  use crate::error::InvocationError;
  use crate::orchestrator::OrchestratorConfig;

  fn transport() -> Arc<dyn Transport> {
    Arc::new(Orchestrator::new(
      OrchestratorConfig::default(),
      Arc::new(InlinePool::new(FatalSink::new())),
    ))
  }

  #[tokio::test(start_paused = true)]
  async fn test_execute_returns_output() {
    let transport = transport();
    let input = TaskInput::new("hello world", 2.5, 0, 0).unwrap();

    let output = transport.execute(Submission::new(input)).await.unwrap();
    assert_eq!(output.text, "2.5s later...");
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_through_transport() {
    let transport = transport();
    let input = TaskInput::new("hello world", 60.0, 0, 0).unwrap();

    let id = transport
      .submit(Submission::new(input).with_id("to-cancel"))
      .await
      .unwrap();
    transport.cancel(&id).await.unwrap();

    let err = transport.await_result(&id).await.unwrap_err();
    assert!(matches!(
      err,
      TransportError::Invocation(InvocationError::Cancelled { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn test_await_unknown_id() {
    let err = transport()
      .await_result(&InvocationId::new("missing"))
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      TransportError::Submission(OrchestratorError::NotFound(_))
    ));
  }
}
