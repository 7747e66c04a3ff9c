//! Invocation records, live and archived.
//!
//! The orchestrator is the only writer. Records move from the live table to a
//! bounded archive once they are terminal and their result has been handed
//! over, so the live table holds only work in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use fanout_workflow::{
  ChildKind, ChildRef, ChildResult, InvocationId, InvocationStatus, TaskInvocation, TaskOutput,
};

use crate::error::StoreError;

/// Default number of archived records kept by [`MemoryStore`].
pub const DEFAULT_ARCHIVE_RETENTION: usize = 1024;

/// Persistence for invocation records.
#[async_trait]
pub trait InvocationStore: Send + Sync {
  /// Add a new live record. Fails if a live record with the same id exists.
  async fn create(&self, invocation: TaskInvocation) -> Result<(), StoreError>;

  /// Fetch a record, live or archived.
  async fn get(&self, id: &InvocationId) -> Result<TaskInvocation, StoreError>;

  /// Move a live record to `status`.
  async fn advance(&self, id: &InvocationId, status: InvocationStatus) -> Result<(), StoreError>;

  /// Restart the phase sequence for attempt number `attempt`.
  async fn begin_attempt(&self, id: &InvocationId, attempt: u32) -> Result<(), StoreError>;

  /// Record the children issued by the current attempt.
  async fn set_children(&self, id: &InvocationId, children: Vec<ChildRef>)
  -> Result<(), StoreError>;

  /// Record the outcome of one child.
  async fn resolve_child(
    &self,
    id: &InvocationId,
    kind: ChildKind,
    index: u32,
    result: ChildResult,
  ) -> Result<(), StoreError>;

  /// Mark a live record Completed with its output.
  async fn complete(&self, id: &InvocationId, output: TaskOutput) -> Result<(), StoreError>;

  /// Mark a live record Failed or TimedOut.
  async fn fail(
    &self,
    id: &InvocationId,
    status: InvocationStatus,
    error: String,
  ) -> Result<(), StoreError>;

  /// Move a terminal record out of the live table.
  async fn archive(&self, id: &InvocationId) -> Result<(), StoreError>;

  /// Number of live records.
  async fn live_count(&self) -> Result<usize, StoreError>;
}

/// In-memory store.
pub struct MemoryStore {
  state: Mutex<State>,
  retention: usize,
}

#[derive(Default)]
struct State {
  live: HashMap<InvocationId, TaskInvocation>,
  archived: HashMap<InvocationId, TaskInvocation>,
  archive_order: VecDeque<InvocationId>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::with_retention(DEFAULT_ARCHIVE_RETENTION)
  }

  /// Keep at most `retention` archived records, dropping the oldest first.
  pub fn with_retention(retention: usize) -> Self {
    Self {
      state: Mutex::new(State::default()),
      retention,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
    self.state.lock().map_err(|_| StoreError::Poisoned)
  }

  fn update<F>(&self, id: &InvocationId, f: F) -> Result<(), StoreError>
  where
    F: FnOnce(&mut TaskInvocation) -> Result<(), StoreError>,
  {
    let mut state = self.lock()?;
    let invocation = state
      .live
      .get_mut(id)
      .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
    f(invocation)
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl InvocationStore for MemoryStore {
  async fn create(&self, invocation: TaskInvocation) -> Result<(), StoreError> {
    let mut state = self.lock()?;
    if state.live.contains_key(&invocation.id) {
      return Err(StoreError::AlreadyExists {
        id: invocation.id.clone(),
      });
    }
    state.live.insert(invocation.id.clone(), invocation);
    Ok(())
  }

  async fn get(&self, id: &InvocationId) -> Result<TaskInvocation, StoreError> {
    let state = self.lock()?;
    state
      .live
      .get(id)
      .or_else(|| state.archived.get(id))
      .cloned()
      .ok_or_else(|| StoreError::NotFound { id: id.clone() })
  }

  async fn advance(&self, id: &InvocationId, status: InvocationStatus) -> Result<(), StoreError> {
    self.update(id, |invocation| Ok(invocation.advance(status)?))
  }

  async fn begin_attempt(&self, id: &InvocationId, attempt: u32) -> Result<(), StoreError> {
    self.update(id, |invocation| Ok(invocation.begin_attempt(attempt)?))
  }

  async fn set_children(
    &self,
    id: &InvocationId,
    children: Vec<ChildRef>,
  ) -> Result<(), StoreError> {
    self.update(id, |invocation| {
      invocation.children = children;
      Ok(())
    })
  }

  async fn resolve_child(
    &self,
    id: &InvocationId,
    kind: ChildKind,
    index: u32,
    result: ChildResult,
  ) -> Result<(), StoreError> {
    self.update(id, |invocation| {
      invocation.child_mut(kind, index)?.result = result;
      Ok(())
    })
  }

  async fn complete(&self, id: &InvocationId, output: TaskOutput) -> Result<(), StoreError> {
    self.update(id, |invocation| {
      invocation.advance(InvocationStatus::Completed)?;
      invocation.output = Some(output);
      Ok(())
    })
  }

  async fn fail(
    &self,
    id: &InvocationId,
    status: InvocationStatus,
    error: String,
  ) -> Result<(), StoreError> {
    self.update(id, |invocation| {
      invocation.advance(status)?;
      invocation.error = Some(error);
      Ok(())
    })
  }

  async fn archive(&self, id: &InvocationId) -> Result<(), StoreError> {
    let mut state = self.lock()?;
    let status = state
      .live
      .get(id)
      .map(|invocation| invocation.status)
      .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
    if !status.is_terminal() {
      return Err(StoreError::NotTerminal {
        id: id.clone(),
        status,
      });
    }

    if let Some(invocation) = state.live.remove(id) {
      // Drop the previous archived run of a reused id before re-adding it
      if state.archived.insert(id.clone(), invocation).is_some() {
        state.archive_order.retain(|archived| archived != id);
      }
      state.archive_order.push_back(id.clone());
    }

    while state.archive_order.len() > self.retention {
      if let Some(oldest) = state.archive_order.pop_front() {
        state.archived.remove(&oldest);
      }
    }
    Ok(())
  }

  async fn live_count(&self) -> Result<usize, StoreError> {
    Ok(self.lock()?.live.len())
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use fanout_workflow::{RetryPolicy, TaskInput};

  use super::*;

  fn record(id: &str) -> TaskInvocation {
    let input = TaskInput::new("hello", 1.0, 1, 0).unwrap();
    TaskInvocation::new(InvocationId::new(id), input)
  }

  async fn finish(store: &MemoryStore, id: &InvocationId) {
    store.advance(id, InvocationStatus::Sleeping).await.unwrap();
    store
      .complete(id, TaskOutput::from_delay(Duration::from_secs(1)))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_create_rejects_live_duplicate() {
    let store = MemoryStore::new();
    store.create(record("a")).await.unwrap();

    let err = store.create(record("a")).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
  }

  #[tokio::test]
  async fn test_backward_transition_is_rejected() {
    let store = MemoryStore::new();
    let id = InvocationId::new("a");
    store.create(record("a")).await.unwrap();
    store
      .advance(&id, InvocationStatus::AwaitingChildren)
      .await
      .unwrap();

    let err = store
      .advance(&id, InvocationStatus::Sleeping)
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::Workflow(_)));
  }

  #[tokio::test]
  async fn test_resolve_child_updates_only_that_child() {
    let store = MemoryStore::new();
    let id = InvocationId::new("p");
    store.create(record("p")).await.unwrap();

    let children = (0..2)
      .map(|i| ChildRef::new(&id, ChildKind::Task, i, Duration::from_secs(60), RetryPolicy::NO_RETRY))
      .collect();
    store.set_children(&id, children).await.unwrap();
    store
      .resolve_child(&id, ChildKind::Task, 1, ChildResult::Value(serde_json::json!(1)))
      .await
      .unwrap();

    let invocation = store.get(&id).await.unwrap();
    assert_eq!(invocation.pending_children(), 1);
    assert!(invocation.children[0].is_pending());

    let missing = store
      .resolve_child(&id, ChildKind::Activity, 0, ChildResult::Pending)
      .await
      .unwrap_err();
    assert!(matches!(missing, StoreError::Workflow(_)));
  }

  #[tokio::test]
  async fn test_archive_requires_terminal_status() {
    let store = MemoryStore::new();
    let id = InvocationId::new("a");
    store.create(record("a")).await.unwrap();

    let err = store.archive(&id).await.unwrap_err();
    assert!(matches!(err, StoreError::NotTerminal { .. }));

    finish(&store, &id).await;
    store.archive(&id).await.unwrap();
    assert_eq!(store.live_count().await.unwrap(), 0);
    assert_eq!(
      store.get(&id).await.unwrap().status,
      InvocationStatus::Completed
    );
  }

  #[tokio::test]
  async fn test_archive_is_bounded() {
    let store = MemoryStore::with_retention(2);
    for name in ["a", "b", "c"] {
      let id = InvocationId::new(name);
      store.create(record(name)).await.unwrap();
      finish(&store, &id).await;
      store.archive(&id).await.unwrap();
    }

    assert!(matches!(
      store.get(&InvocationId::new("a")).await,
      Err(StoreError::NotFound { .. })
    ));
    assert!(store.get(&InvocationId::new("c")).await.is_ok());
  }

  #[tokio::test]
  async fn test_terminal_record_cannot_fail_again() {
    let store = MemoryStore::new();
    let id = InvocationId::new("a");
    store.create(record("a")).await.unwrap();
    finish(&store, &id).await;

    let err = store
      .fail(&id, InvocationStatus::Failed, "late".to_string())
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::Workflow(_)));
  }
}
