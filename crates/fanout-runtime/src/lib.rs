//! Fanout Runtime
//!
//! Drives recursive fan-out task invocations: sleep, fan out to leaf
//! activities and child tasks, join, aggregate.
//!
//! # Architecture
//!
//! ```text
//! Transport (submit / await / cancel)
//!     │
//!     ▼
//! Orchestrator ── InvocationStore (live records + bounded archive)
//!     │        └─ ExecutionNotifier (events)
//!     │
//!     │ per attempt, under execution / run deadlines
//!     ▼
//! TaskDefinition
//!     ├── N × LeafActivity ──► WorkerPool slot
//!     └── M × child task ───► Orchestrator (recursive, depth 1)
//! ```
//!
//! Every child gets a cancellation token derived from its parent's attempt.
//! When a deadline expires or the caller cancels, the attempt cancels its
//! children and waits for them to settle before it reports, so nothing
//! outlives its parent.
//!
//! [`Worker`] serves a channel of submissions until cancelled or until the
//! pool faults. [`Diagnostics`] optionally logs load at an interval.

mod activity;
mod definition;
mod diagnostics;
mod error;
mod events;
mod orchestrator;
mod store;
mod transport;
mod worker;

pub use activity::{LeafActivity, SleepActivity, delay_millis};
pub use definition::{FanOutPolicy, InvocationContext, PlannedChild, TaskDefinition};
pub use diagnostics::Diagnostics;
pub use error::{
  InvocationError, OrchestratorError, StoreError, TimeoutKind, TransportError, WorkerError,
};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use orchestrator::{
  InvocationHandle, InvocationOptions, InvocationResult, Orchestrator, OrchestratorBuilder,
  OrchestratorConfig, RuntimeSnapshot, Submission,
};
pub use store::{DEFAULT_ARCHIVE_RETENTION, InvocationStore, MemoryStore};
pub use transport::Transport;
pub use worker::{Worker, WorkerReport};
