//! Invocation records.
//!
//! A [`TaskInvocation`] is the orchestrator's view of one running task: its
//! input, where it is in the phase sequence, and the children it fanned out
//! to. Children are referenced from the parent only.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::input::{TaskInput, TaskOutput};
use crate::policy::RetryPolicy;

/// Unique identifier of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Identifier of the `index`-th child of the given kind.
  pub fn child(&self, kind: ChildKind, index: u32) -> InvocationId {
    InvocationId(format!("{}-{}-{}", self.0, kind, index))
  }
}

impl fmt::Display for InvocationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for InvocationId {
  fn from(value: &str) -> Self {
    Self::new(value)
  }
}

/// Kind of a fan-out child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
  Activity,
  Task,
}

impl fmt::Display for ChildKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ChildKind::Activity => f.write_str("activity"),
      ChildKind::Task => f.write_str("task"),
    }
  }
}

/// Phase of an invocation.
///
/// Phases only move forward. `Sleeping` may jump straight to `Completed` when
/// there is nothing to fan out to, and any non-terminal phase may end in
/// `Failed` or `TimedOut`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
  Pending,
  Sleeping,
  FanningOut,
  AwaitingChildren,
  Completed,
  Failed,
  TimedOut,
}

impl InvocationStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      InvocationStatus::Completed | InvocationStatus::Failed | InvocationStatus::TimedOut
    )
  }

  fn rank(&self) -> u8 {
    match self {
      InvocationStatus::Pending => 0,
      InvocationStatus::Sleeping => 1,
      InvocationStatus::FanningOut => 2,
      InvocationStatus::AwaitingChildren => 3,
      InvocationStatus::Completed | InvocationStatus::Failed | InvocationStatus::TimedOut => 4,
    }
  }

  pub fn can_transition_to(&self, next: InvocationStatus) -> bool {
    if self.is_terminal() {
      return false;
    }
    match next {
      InvocationStatus::Failed | InvocationStatus::TimedOut => true,
      _ => next.rank() > self.rank(),
    }
  }
}

impl fmt::Display for InvocationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      InvocationStatus::Pending => "pending",
      InvocationStatus::Sleeping => "sleeping",
      InvocationStatus::FanningOut => "fanning_out",
      InvocationStatus::AwaitingChildren => "awaiting_children",
      InvocationStatus::Completed => "completed",
      InvocationStatus::Failed => "failed",
      InvocationStatus::TimedOut => "timed_out",
    };
    f.write_str(name)
  }
}

/// Outcome of a child as seen by its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum ChildResult {
  Pending,
  Value(serde_json::Value),
  Error(String),
}

/// A parent's reference to one of its fan-out children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
  pub kind: ChildKind,
  /// Position within its kind in the fan-out, 0-based.
  pub index: u32,
  pub invocation_id: InvocationId,
  #[serde(with = "crate::input::secs")]
  pub timeout: Duration,
  pub retry_policy: RetryPolicy,
  pub result: ChildResult,
}

impl ChildRef {
  pub fn new(
    parent: &InvocationId,
    kind: ChildKind,
    index: u32,
    timeout: Duration,
    retry_policy: RetryPolicy,
  ) -> Self {
    Self {
      kind,
      index,
      invocation_id: parent.child(kind, index),
      timeout,
      retry_policy,
      result: ChildResult::Pending,
    }
  }

  pub fn is_pending(&self) -> bool {
    matches!(self.result, ChildResult::Pending)
  }
}

/// The record of one task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
  pub id: InvocationId,
  pub input: TaskInput,
  pub status: InvocationStatus,
  /// Current attempt, starting at 1.
  pub attempt: u32,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub children: Vec<ChildRef>,
  pub output: Option<TaskOutput>,
  pub error: Option<String>,
}

impl TaskInvocation {
  pub fn new(id: InvocationId, input: TaskInput) -> Self {
    Self {
      id,
      input,
      status: InvocationStatus::Pending,
      attempt: 1,
      started_at: Utc::now(),
      completed_at: None,
      children: Vec::new(),
      output: None,
      error: None,
    }
  }

  /// Move to `next`, rejecting backwards moves and moves out of a terminal
  /// status.
  pub fn advance(&mut self, next: InvocationStatus) -> Result<(), WorkflowError> {
    if !self.status.can_transition_to(next) {
      return Err(WorkflowError::InvalidTransition {
        id: self.id.to_string(),
        from: self.status,
        to: next,
      });
    }
    self.status = next;
    if next.is_terminal() {
      self.completed_at = Some(Utc::now());
    }
    Ok(())
  }

  /// Reset the phase sequence for a retry.
  ///
  /// Children of the failed attempt are dropped. Terminal invocations never
  /// start another attempt.
  pub fn begin_attempt(&mut self, attempt: u32) -> Result<(), WorkflowError> {
    if self.status.is_terminal() {
      return Err(WorkflowError::AttemptAfterTerminal {
        id: self.id.to_string(),
        status: self.status,
      });
    }
    self.attempt = attempt;
    self.status = InvocationStatus::Pending;
    self.children.clear();
    Ok(())
  }

  pub fn child_mut(&mut self, kind: ChildKind, index: u32) -> Result<&mut ChildRef, WorkflowError> {
    let id = self.id.to_string();
    self
      .children
      .iter_mut()
      .find(|c| c.kind == kind && c.index == index)
      .ok_or(WorkflowError::ChildNotFound { id, kind, index })
  }

  /// Children that have not reported a result yet.
  pub fn pending_children(&self) -> usize {
    self.children.iter().filter(|c| c.is_pending()).count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::policy::CHILD_TASK_TIMEOUT;

  fn invocation() -> TaskInvocation {
    let input = TaskInput::new("hello", 1.0, 1, 1).unwrap();
    TaskInvocation::new(InvocationId::new("root"), input)
  }

  #[test]
  fn test_forward_transitions() {
    let mut inv = invocation();
    inv.advance(InvocationStatus::Sleeping).unwrap();
    inv.advance(InvocationStatus::FanningOut).unwrap();
    inv.advance(InvocationStatus::AwaitingChildren).unwrap();
    inv.advance(InvocationStatus::Completed).unwrap();
    assert!(inv.completed_at.is_some());
  }

  #[test]
  fn test_sleeping_may_complete_directly() {
    let mut inv = invocation();
    inv.advance(InvocationStatus::Sleeping).unwrap();
    inv.advance(InvocationStatus::Completed).unwrap();
    assert_eq!(inv.status, InvocationStatus::Completed);
  }

  #[test]
  fn test_backward_transition_rejected() {
    let mut inv = invocation();
    inv.advance(InvocationStatus::FanningOut).unwrap();
    let err = inv.advance(InvocationStatus::Sleeping).unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
  }

  #[test]
  fn test_terminal_is_final() {
    let mut inv = invocation();
    inv.advance(InvocationStatus::TimedOut).unwrap();
    assert!(inv.advance(InvocationStatus::Failed).is_err());
    assert!(inv.advance(InvocationStatus::Completed).is_err());
    assert!(inv.begin_attempt(2).is_err());
  }

  #[test]
  fn test_any_live_phase_can_fail() {
    for phase in [
      InvocationStatus::Pending,
      InvocationStatus::Sleeping,
      InvocationStatus::FanningOut,
      InvocationStatus::AwaitingChildren,
    ] {
      assert!(phase.can_transition_to(InvocationStatus::Failed));
      assert!(phase.can_transition_to(InvocationStatus::TimedOut));
    }
  }

  #[test]
  fn test_begin_attempt_resets_phase_and_children() {
    let mut inv = invocation();
    inv.advance(InvocationStatus::AwaitingChildren).unwrap();
    inv.children.push(ChildRef::new(
      &inv.id,
      ChildKind::Task,
      0,
      CHILD_TASK_TIMEOUT,
      RetryPolicy::NO_RETRY,
    ));

    inv.begin_attempt(2).unwrap();
    assert_eq!(inv.attempt, 2);
    assert_eq!(inv.status, InvocationStatus::Pending);
    assert!(inv.children.is_empty());
  }

  #[test]
  fn test_child_ids_carry_kind_and_index() {
    let parent = InvocationId::new("root");
    assert_eq!(parent.child(ChildKind::Task, 3).as_str(), "root-task-3");
    assert_eq!(parent.child(ChildKind::Activity, 0).as_str(), "root-activity-0");
  }

  #[test]
  fn test_child_mut_and_pending_count() {
    let mut inv = invocation();
    inv.children.push(ChildRef::new(
      &inv.id,
      ChildKind::Activity,
      0,
      CHILD_TASK_TIMEOUT,
      RetryPolicy::NO_RETRY,
    ));
    assert_eq!(inv.pending_children(), 1);

    inv.child_mut(ChildKind::Activity, 0).unwrap().result =
      ChildResult::Value(serde_json::json!(1000.0));
    assert_eq!(inv.pending_children(), 0);
    assert!(inv.child_mut(ChildKind::Task, 0).is_err());
  }
}
