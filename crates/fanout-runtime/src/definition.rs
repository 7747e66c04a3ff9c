//! The task definition: what one invocation does, phase by phase.
//!
//! ```text
//! Sleeping ──► FanningOut ──► AwaitingChildren ──► (aggregate)
//!    │              │                │
//!  delay      N activities     join_all(children)
//!             M child tasks    first failure wins
//! ```
//!
//! The definition decides *what* happens. Everything with side effects
//! (records, the pool, child invocations, events) goes through an
//! [`InvocationContext`] supplied by the orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fanout_workflow::{
  ACTIVITY_TIMEOUT, CHILD_TASK_TIMEOUT, ChildKind, ChildRef, ChildResult, InvocationId,
  InvocationStatus, RetryPolicy, TaskInput, TaskOutput,
};

use crate::error::InvocationError;
use crate::events::ExecutionEvent;

/// Timeouts and retry policies applied to every fan-out edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanOutPolicy {
  /// Start-to-close bound of each activity.
  pub activity_timeout: Duration,
  pub activity_retry: RetryPolicy,
  /// Execution and run bound of each child task.
  pub child_task_timeout: Duration,
  pub child_task_retry: RetryPolicy,
}

impl Default for FanOutPolicy {
  fn default() -> Self {
    Self {
      activity_timeout: ACTIVITY_TIMEOUT,
      activity_retry: RetryPolicy::NO_RETRY,
      child_task_timeout: CHILD_TASK_TIMEOUT,
      child_task_retry: RetryPolicy::NO_RETRY,
    }
  }
}

/// A child about to be issued, with the input it will receive.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChild {
  pub child: ChildRef,
  pub input: TaskInput,
}

/// Side effects available to a running attempt.
#[async_trait]
pub trait InvocationContext: Send + Sync {
  fn invocation_id(&self) -> &InvocationId;

  /// Cancelled when the attempt must stop: deadline, parent or caller.
  fn cancellation(&self) -> &CancellationToken;

  async fn enter(&self, status: InvocationStatus) -> Result<(), InvocationError>;

  async fn record_children(&self, children: &[ChildRef]) -> Result<(), InvocationError>;

  async fn run_activity(
    &self,
    child: &ChildRef,
    input: TaskInput,
  ) -> Result<serde_json::Value, InvocationError>;

  async fn run_task(&self, child: &ChildRef, input: TaskInput)
  -> Result<TaskOutput, InvocationError>;

  async fn resolve_child(&self, child: &ChildRef, result: ChildResult)
  -> Result<(), InvocationError>;

  fn notify(&self, event: ExecutionEvent);
}

/// The recursive fan-out task.
#[derive(Debug, Clone, Default)]
pub struct TaskDefinition {
  policy: FanOutPolicy,
}

impl TaskDefinition {
  pub fn new(policy: FanOutPolicy) -> Self {
    Self { policy }
  }

  pub fn policy(&self) -> &FanOutPolicy {
    &self.policy
  }

  /// Children of `input` in fan-out order: activities first, then tasks.
  ///
  /// Activities get a copy of the parent input. Child tasks get
  /// [`TaskInput::derive_child`] of their own index, so they never fan out.
  pub fn plan(&self, parent: &InvocationId, input: &TaskInput) -> Vec<PlannedChild> {
    let activities = (0..input.child_activity_count).map(|index| PlannedChild {
      child: ChildRef::new(
        parent,
        ChildKind::Activity,
        index,
        self.policy.activity_timeout,
        self.policy.activity_retry,
      ),
      input: input.clone(),
    });
    let tasks = (0..input.child_task_count).map(|index| PlannedChild {
      child: ChildRef::new(
        parent,
        ChildKind::Task,
        index,
        self.policy.child_task_timeout,
        self.policy.child_task_retry,
      ),
      input: input.derive_child(index),
    });
    activities.chain(tasks).collect()
  }

  /// Run one attempt from the sleep to the aggregate.
  pub async fn run(
    &self,
    ctx: &dyn InvocationContext,
    input: &TaskInput,
  ) -> Result<TaskOutput, InvocationError> {
    let id = ctx.invocation_id().clone();

    ctx.enter(InvocationStatus::Sleeping).await?;
    info!(
      invocation_id = %id,
      text = %input.text,
      "going to sleep for {}s",
      input.delay.as_secs_f64()
    );
    tokio::select! {
      _ = tokio::time::sleep(input.delay) => {}
      _ = ctx.cancellation().cancelled() => {
        return Err(InvocationError::Cancelled { id });
      }
    }

    if input.is_leaf() {
      return Ok(TaskOutput::from_delay(input.delay));
    }

    ctx.enter(InvocationStatus::FanningOut).await?;
    let planned = self.plan(&id, input);
    let children: Vec<ChildRef> = planned.iter().map(|p| p.child.clone()).collect();
    ctx.record_children(&children).await?;

    ctx.enter(InvocationStatus::AwaitingChildren).await?;
    let outcomes = join_all(planned.into_iter().map(|p| self.run_child(ctx, p))).await;

    let mut values = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (child, outcome) in outcomes {
      match outcome {
        Ok(value) => values.push(value),
        Err(err) => failures.push((child, err)),
      }
    }

    // Report the first failure in fan-out order. Once cancelled, only a pool
    // fault is worth more than the cancellation itself.
    let reported = if ctx.cancellation().is_cancelled() {
      match failures.iter().position(|(_, err)| err.pool_fault().is_some()) {
        Some(position) => position,
        None => return Err(InvocationError::Cancelled { id }),
      }
    } else {
      0
    };

    let other_failures = failures.len().saturating_sub(1);
    if reported < failures.len() {
      let (child, err) = failures.swap_remove(reported);
      return Err(InvocationError::ChildFailed {
        kind: child.kind,
        index: child.index,
        invocation_id: child.invocation_id,
        other_failures,
        source: Box::new(err),
      });
    }

    info!(invocation_id = %id, "result: {}", serde_json::Value::Array(values));
    Ok(TaskOutput::from_delay(input.delay))
  }

  async fn run_child(
    &self,
    ctx: &dyn InvocationContext,
    planned: PlannedChild,
  ) -> (ChildRef, Result<serde_json::Value, InvocationError>) {
    let PlannedChild { child, input } = planned;
    let parent = ctx.invocation_id().clone();

    ctx.notify(ExecutionEvent::ChildStarted {
      invocation_id: parent.clone(),
      child_id: child.invocation_id.clone(),
      kind: child.kind,
      index: child.index,
    });

    let outcome = match child.kind {
      ChildKind::Activity => ctx.run_activity(&child, input).await,
      ChildKind::Task => ctx.run_task(&child, input).await.and_then(|output| {
        serde_json::to_value(output).map_err(|e| InvocationError::Internal {
          message: e.to_string(),
        })
      }),
    };

    let result = match &outcome {
      Ok(value) => ChildResult::Value(value.clone()),
      Err(err) => ChildResult::Error(err.chain()),
    };
    if let Err(err) = ctx.resolve_child(&child, result).await {
      warn!(invocation_id = %parent, child_id = %child.invocation_id, error = %err, "failed to record child result");
    }

    match &outcome {
      Ok(value) => ctx.notify(ExecutionEvent::ChildCompleted {
        invocation_id: parent,
        child_id: child.invocation_id.clone(),
        kind: child.kind,
        index: child.index,
        data: value.clone(),
      }),
      Err(err) => ctx.notify(ExecutionEvent::ChildFailed {
        invocation_id: parent,
        child_id: child.invocation_id.clone(),
        kind: child.kind,
        index: child.index,
        error: err.chain(),
      }),
    }

    (child, outcome)
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;
  use std::sync::Mutex;

  use super::*;
  use crate::activity::delay_millis;

  /// Context that records every call and answers children directly.
  struct FakeContext {
    id: InvocationId,
    cancel: CancellationToken,
    failing: HashSet<(ChildKind, u32)>,
    phases: Mutex<Vec<InvocationStatus>>,
    recorded: Mutex<Vec<ChildRef>>,
    task_inputs: Mutex<Vec<TaskInput>>,
    resolved: Mutex<Vec<(ChildKind, u32, ChildResult)>>,
  }

  impl FakeContext {
    fn new() -> Self {
      Self {
        id: InvocationId::new("root"),
        cancel: CancellationToken::new(),
        failing: HashSet::new(),
        phases: Mutex::new(Vec::new()),
        recorded: Mutex::new(Vec::new()),
        task_inputs: Mutex::new(Vec::new()),
        resolved: Mutex::new(Vec::new()),
      }
    }

    fn failing(mut self, kind: ChildKind, index: u32) -> Self {
      self.failing.insert((kind, index));
      self
    }

    fn fail_if_configured(&self, child: &ChildRef) -> Result<(), InvocationError> {
      if self.failing.contains(&(child.kind, child.index)) {
        return Err(InvocationError::Activity {
          id: child.invocation_id.clone(),
          message: "configured to fail".to_string(),
        });
      }
      Ok(())
    }
  }

  #[async_trait]
  impl InvocationContext for FakeContext {
    fn invocation_id(&self) -> &InvocationId {
      &self.id
    }

    fn cancellation(&self) -> &CancellationToken {
      &self.cancel
    }

    async fn enter(&self, status: InvocationStatus) -> Result<(), InvocationError> {
      self.phases.lock().unwrap().push(status);
      Ok(())
    }

    async fn record_children(&self, children: &[ChildRef]) -> Result<(), InvocationError> {
      self.recorded.lock().unwrap().extend_from_slice(children);
      Ok(())
    }

    async fn run_activity(
      &self,
      child: &ChildRef,
      input: TaskInput,
    ) -> Result<serde_json::Value, InvocationError> {
      self.fail_if_configured(child)?;
      Ok(serde_json::json!(delay_millis(input.delay)))
    }

    async fn run_task(
      &self,
      child: &ChildRef,
      input: TaskInput,
    ) -> Result<TaskOutput, InvocationError> {
      self.task_inputs.lock().unwrap().push(input.clone());
      self.fail_if_configured(child)?;
      Ok(TaskOutput::from_delay(input.delay))
    }

    async fn resolve_child(
      &self,
      child: &ChildRef,
      result: ChildResult,
    ) -> Result<(), InvocationError> {
      self
        .resolved
        .lock()
        .unwrap()
        .push((child.kind, child.index, result));
      Ok(())
    }

    fn notify(&self, _event: ExecutionEvent) {}
  }

  fn input(delay_secs: f64, tasks: u32, activities: u32) -> TaskInput {
    TaskInput::new("hello world", delay_secs, tasks, activities).unwrap()
  }

  #[test]
  fn test_plan_orders_activities_then_tasks() {
    let definition = TaskDefinition::default();
    let planned = definition.plan(&InvocationId::new("root"), &input(5.0, 2, 3));

    let ids: Vec<&str> = planned
      .iter()
      .map(|p| p.child.invocation_id.as_str())
      .collect();
    assert_eq!(
      ids,
      [
        "root-activity-0",
        "root-activity-1",
        "root-activity-2",
        "root-task-0",
        "root-task-1"
      ]
    );
    assert_eq!(planned[0].child.timeout, ACTIVITY_TIMEOUT);
    assert_eq!(planned[3].child.timeout, CHILD_TASK_TIMEOUT);
    assert_eq!(planned[3].child.retry_policy, RetryPolicy::NO_RETRY);
  }

  #[test]
  fn test_plan_derives_child_task_inputs() {
    let definition = TaskDefinition::default();
    let parent = input(5.0, 2, 1);
    let planned = definition.plan(&InvocationId::new("root"), &parent);

    assert_eq!(planned[0].input, parent);
    assert_eq!(planned[1].input.text, "hello world-0");
    assert_eq!(planned[2].input.text, "hello world-1");
    assert!(planned[1..].iter().all(|p| p.input.is_leaf()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_zero_fan_out_skips_to_aggregate() {
    let ctx = FakeContext::new();
    let output = TaskDefinition::default()
      .run(&ctx, &input(5.0, 0, 0))
      .await
      .unwrap();

    assert_eq!(output.text, "5.0s later...");
    assert_eq!(*ctx.phases.lock().unwrap(), [InvocationStatus::Sleeping]);
    assert!(ctx.recorded.lock().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_fan_out_joins_every_child() {
    let ctx = FakeContext::new();
    let output = TaskDefinition::default()
      .run(&ctx, &input(5.0, 2, 3))
      .await
      .unwrap();

    assert_eq!(output.text, "5.0s later...");
    assert_eq!(
      *ctx.phases.lock().unwrap(),
      [
        InvocationStatus::Sleeping,
        InvocationStatus::FanningOut,
        InvocationStatus::AwaitingChildren
      ]
    );
    assert_eq!(ctx.recorded.lock().unwrap().len(), 5);

    let resolved = ctx.resolved.lock().unwrap();
    assert_eq!(resolved.len(), 5);
    for (kind, _, result) in resolved.iter() {
      let expected = match kind {
        ChildKind::Activity => serde_json::json!(5000.0),
        ChildKind::Task => serde_json::json!({ "text": "5.0s later..." }),
      };
      assert_eq!(*result, ChildResult::Value(expected));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_first_failure_in_fan_out_order_is_reported() {
    let ctx = FakeContext::new()
      .failing(ChildKind::Task, 1)
      .failing(ChildKind::Activity, 2);

    let err = TaskDefinition::default()
      .run(&ctx, &input(1.0, 2, 3))
      .await
      .unwrap_err();

    match err {
      InvocationError::ChildFailed {
        kind,
        index,
        other_failures,
        ..
      } => {
        assert_eq!(kind, ChildKind::Activity);
        assert_eq!(index, 2);
        assert_eq!(other_failures, 1);
      }
      other => panic!("expected child failure, got {other:?}"),
    }
    // Full barrier: every child still ran and reported
    assert_eq!(ctx.resolved.lock().unwrap().len(), 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_during_sleep_never_fans_out() {
    let ctx = FakeContext::new();
    ctx.cancel.cancel();

    let err = TaskDefinition::default()
      .run(&ctx, &input(5.0, 2, 2))
      .await
      .unwrap_err();

    assert!(matches!(err, InvocationError::Cancelled { .. }));
    assert!(ctx.recorded.lock().unwrap().is_empty());
    assert!(ctx.task_inputs.lock().unwrap().is_empty());
  }
}
