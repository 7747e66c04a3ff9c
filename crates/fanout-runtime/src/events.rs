//! Execution events and notifiers.
//!
//! The orchestrator emits an event at every lifecycle step of every
//! invocation. Consumers decide what to do with them: tests use them to
//! observe ordering, a UI could stream them.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fanout_workflow::{ChildKind, InvocationId, InvocationStatus, TaskOutput};

/// Events emitted while invocations run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// An invocation was accepted and its record created.
  InvocationStarted { invocation_id: InvocationId },

  /// An invocation entered a non-terminal phase.
  PhaseEntered {
    invocation_id: InvocationId,
    status: InvocationStatus,
  },

  /// A parent issued a child.
  ChildStarted {
    invocation_id: InvocationId,
    child_id: InvocationId,
    kind: ChildKind,
    index: u32,
  },

  /// A child delivered a value to its parent.
  ChildCompleted {
    invocation_id: InvocationId,
    child_id: InvocationId,
    kind: ChildKind,
    index: u32,
    data: serde_json::Value,
  },

  /// A child delivered a failure to its parent.
  ChildFailed {
    invocation_id: InvocationId,
    child_id: InvocationId,
    kind: ChildKind,
    index: u32,
    error: String,
  },

  /// An attempt failed and another one will follow.
  AttemptFailed {
    invocation_id: InvocationId,
    attempt: u32,
    error: String,
  },

  InvocationCompleted {
    invocation_id: InvocationId,
    output: TaskOutput,
  },

  InvocationFailed {
    invocation_id: InvocationId,
    status: InvocationStatus,
    error: String,
  },
}

impl ExecutionEvent {
  /// The invocation this event is about. For child events, the parent.
  pub fn invocation_id(&self) -> &InvocationId {
    match self {
      ExecutionEvent::InvocationStarted { invocation_id }
      | ExecutionEvent::PhaseEntered { invocation_id, .. }
      | ExecutionEvent::ChildStarted { invocation_id, .. }
      | ExecutionEvent::ChildCompleted { invocation_id, .. }
      | ExecutionEvent::ChildFailed { invocation_id, .. }
      | ExecutionEvent::AttemptFailed { invocation_id, .. }
      | ExecutionEvent::InvocationCompleted { invocation_id, .. }
      | ExecutionEvent::InvocationFailed { invocation_id, .. } => invocation_id,
    }
  }
}

/// Receives execution events.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Forwards events to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls an invocation. Volume is a
/// handful of events per invocation.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
