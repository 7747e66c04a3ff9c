//! Invocation lifecycle: submission, attempts, deadlines and cancellation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use fanout_pool::{FatalSink, PoolStats, WorkerPool};
use fanout_workflow::{
  ChildRef, ChildResult, DEFAULT_EXECUTION_TIMEOUT, InvocationId, InvocationStatus, RetryPolicy,
  TASK_NAME, TaskInput, TaskInvocation, TaskOutput,
};

use crate::activity::{LeafActivity, SleepActivity, activity_job};
use crate::definition::{FanOutPolicy, InvocationContext, TaskDefinition};
use crate::error::{InvocationError, OrchestratorError, TimeoutKind};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::store::{InvocationStore, MemoryStore};

/// Outcome of one invocation.
pub type InvocationResult = Result<TaskOutput, InvocationError>;

type SharedResult = Shared<BoxFuture<'static, InvocationResult>>;

/// Orchestrator-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
  /// Prefix of generated top-level ids.
  pub task_prefix: String,
  /// Queue this orchestrator serves.
  pub task_queue: String,
  pub fan_out: FanOutPolicy,
  /// Finished submissions remembered for idempotency before the oldest are
  /// forgotten.
  pub submission_retention: usize,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      task_prefix: "fanout".to_string(),
      task_queue: "fanout".to_string(),
      fan_out: FanOutPolicy::default(),
      submission_retention: 1024,
    }
  }
}

/// Deadlines and retry policy of one invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvocationOptions {
  /// Bound across all attempts.
  pub execution_timeout: Duration,
  /// Bound on each attempt. Unset means only the execution bound applies.
  pub run_timeout: Option<Duration>,
  pub retry_policy: RetryPolicy,
}

impl Default for InvocationOptions {
  fn default() -> Self {
    Self {
      execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
      run_timeout: None,
      retry_policy: RetryPolicy::NO_RETRY,
    }
  }
}

impl InvocationOptions {
  /// Options of a child task: one timeout for both the execution and each run.
  pub fn for_child(timeout: Duration, retry_policy: RetryPolicy) -> Self {
    Self {
      execution_timeout: timeout,
      run_timeout: Some(timeout),
      retry_policy,
    }
  }

  pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
    self.execution_timeout = timeout;
    self
  }

  pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
    self.run_timeout = Some(timeout);
    self
  }

  pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
    self.retry_policy = retry_policy;
    self
  }
}

/// A top-level submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
  /// Caller-chosen id. Generated when unset.
  pub id: Option<InvocationId>,
  pub input: TaskInput,
  pub options: InvocationOptions,
}

impl Submission {
  pub fn new(input: TaskInput) -> Self {
    Self {
      id: None,
      input,
      options: InvocationOptions::default(),
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(InvocationId::new(id));
    self
  }

  pub fn with_options(mut self, options: InvocationOptions) -> Self {
    self.options = options;
    self
  }
}

/// Handle to a submitted invocation. Clones share the same result.
#[derive(Clone)]
pub struct InvocationHandle {
  id: InvocationId,
  result: SharedResult,
  cancel: CancellationToken,
}

impl InvocationHandle {
  pub fn id(&self) -> &InvocationId {
    &self.id
  }

  /// Wait for the terminal result.
  pub async fn result(&self) -> InvocationResult {
    self.result.clone().await
  }

  /// Request cancellation. Outstanding children are cancelled first; the
  /// result then resolves to [`InvocationError::Cancelled`].
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_finished(&self) -> bool {
    self.result.peek().is_some()
  }
}

/// Point-in-time load of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSnapshot {
  pub live_invocations: usize,
  pub tracked_submissions: usize,
  pub pool: PoolStats,
}

/// Drives task invocations and their children.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
  inner: Arc<Inner>,
}

struct Inner {
  config: OrchestratorConfig,
  definition: TaskDefinition,
  pool: Arc<dyn WorkerPool>,
  activity: Arc<dyn LeafActivity>,
  store: Arc<dyn InvocationStore>,
  notifier: Arc<dyn ExecutionNotifier>,
  shutdown: CancellationToken,
  submissions: Mutex<Submissions>,
}

#[derive(Default)]
struct Submissions {
  by_id: HashMap<InvocationId, InvocationHandle>,
  order: VecDeque<InvocationId>,
}

impl Submissions {
  fn insert(&mut self, handle: InvocationHandle, retention: usize) {
    self.order.push_back(handle.id.clone());
    self.by_id.insert(handle.id.clone(), handle);

    while self.by_id.len() > retention {
      let by_id = &self.by_id;
      let Some(position) = self
        .order
        .iter()
        .position(|id| by_id.get(id).is_none_or(InvocationHandle::is_finished))
      else {
        break;
      };
      if let Some(id) = self.order.remove(position) {
        self.by_id.remove(&id);
      }
    }
  }

  fn remove(&mut self, id: &InvocationId) {
    if self.by_id.remove(id).is_some() {
      self.order.retain(|tracked| tracked != id);
    }
  }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
  config: OrchestratorConfig,
  pool: Arc<dyn WorkerPool>,
  activity: Arc<dyn LeafActivity>,
  store: Arc<dyn InvocationStore>,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl OrchestratorBuilder {
  pub fn config(mut self, config: OrchestratorConfig) -> Self {
    self.config = config;
    self
  }

  pub fn activity(mut self, activity: Arc<dyn LeafActivity>) -> Self {
    self.activity = activity;
    self
  }

  pub fn store(mut self, store: Arc<dyn InvocationStore>) -> Self {
    self.store = store;
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn build(self) -> Orchestrator {
    Orchestrator {
      inner: Arc::new(Inner {
        definition: TaskDefinition::new(self.config.fan_out),
        config: self.config,
        pool: self.pool,
        activity: self.activity,
        store: self.store,
        notifier: self.notifier,
        shutdown: CancellationToken::new(),
        submissions: Mutex::new(Submissions::default()),
      }),
    }
  }
}

impl Orchestrator {
  /// Orchestrator with the sleeping activity, an in-memory store and no
  /// event consumer.
  pub fn new(config: OrchestratorConfig, pool: Arc<dyn WorkerPool>) -> Self {
    Self::builder(pool).config(config).build()
  }

  pub fn builder(pool: Arc<dyn WorkerPool>) -> OrchestratorBuilder {
    OrchestratorBuilder {
      config: OrchestratorConfig::default(),
      pool,
      activity: Arc::new(SleepActivity),
      store: Arc::new(MemoryStore::new()),
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.inner.config
  }

  pub fn fatal_sink(&self) -> &FatalSink {
    self.inner.pool.fatal_sink()
  }

  /// Generate a fresh top-level id: `{prefix}-{task name}-{uuid}`.
  pub fn next_id(&self) -> InvocationId {
    InvocationId::new(format!(
      "{}-{}-{}",
      self.inner.config.task_prefix,
      TASK_NAME,
      uuid::Uuid::new_v4()
    ))
  }

  /// Accept a top-level invocation and start driving it.
  ///
  /// Submissions are idempotent by id: re-submitting a known id returns the
  /// existing handle and the original input is kept.
  #[instrument(name = "orchestrator_submit", skip_all)]
  pub async fn submit(&self, submission: Submission) -> Result<InvocationHandle, OrchestratorError> {
    if let Some(fault) = self.fatal_sink().fault() {
      return Err(OrchestratorError::PoolFaulted(fault));
    }
    if self.inner.shutdown.is_cancelled() {
      return Err(OrchestratorError::ShuttingDown);
    }

    let Submission { id, input, options } = submission;
    let id = id.unwrap_or_else(|| self.next_id());

    let (tx, rx) = oneshot::channel::<InvocationResult>();
    let handle = {
      let mut submissions = self.lock_submissions()?;
      if let Some(existing) = submissions.by_id.get(&id) {
        debug!(invocation_id = %id, "duplicate submission");
        return Ok(existing.clone());
      }

      let dropped_id = id.clone();
      let result = async move {
        rx.await.unwrap_or_else(|_| {
          Err(InvocationError::Internal {
            message: format!("invocation '{dropped_id}' ended without a result"),
          })
        })
      }
      .boxed()
      .shared();

      let handle = InvocationHandle {
        id: id.clone(),
        result,
        cancel: self.inner.shutdown.child_token(),
      };
      submissions.insert(handle.clone(), self.inner.config.submission_retention);
      handle
    };

    let record = TaskInvocation::new(id.clone(), input.clone());
    if let Err(err) = self.inner.store.create(record).await {
      // Forget the handle so a later submission of this id starts afresh
      self.lock_submissions()?.remove(&id);
      let _ = tx.send(Err(err.clone().into()));
      return Err(err.into());
    }

    let inner = self.inner.clone();
    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
      let result = drive_invocation(inner, id, input, options, cancel).await;
      // Every handle holder may have gone away
      let _ = tx.send(result);
    });

    Ok(handle)
  }

  /// Handle of a known submission.
  pub fn handle(&self, id: &InvocationId) -> Result<InvocationHandle, OrchestratorError> {
    self
      .lock_submissions()?
      .by_id
      .get(id)
      .cloned()
      .ok_or_else(|| OrchestratorError::NotFound(id.clone()))
  }

  /// Cancel a submission and everything it fanned out to.
  pub fn cancel(&self, id: &InvocationId) -> Result<(), OrchestratorError> {
    let handle = self.handle(id)?;
    info!(invocation_id = %id, "cancellation requested");
    handle.cancel();
    Ok(())
  }

  /// Current record of any invocation, top-level or child, live or archived.
  pub async fn invocation(&self, id: &InvocationId) -> Result<TaskInvocation, OrchestratorError> {
    Ok(self.inner.store.get(id).await?)
  }

  pub async fn snapshot(&self) -> Result<RuntimeSnapshot, OrchestratorError> {
    let live_invocations = self.inner.store.live_count().await?;
    let tracked_submissions = self.lock_submissions()?.by_id.len();
    Ok(RuntimeSnapshot {
      live_invocations,
      tracked_submissions,
      pool: self.inner.pool.stats(),
    })
  }

  /// Stop accepting submissions and cancel everything in flight.
  pub fn shutdown(&self) {
    if !self.inner.shutdown.is_cancelled() {
      info!("orchestrator shutting down");
      self.inner.shutdown.cancel();
    }
  }

  pub fn is_shut_down(&self) -> bool {
    self.inner.shutdown.is_cancelled()
  }

  fn lock_submissions(&self) -> Result<MutexGuard<'_, Submissions>, OrchestratorError> {
    self
      .inner
      .submissions
      .lock()
      .map_err(|_| OrchestratorError::Poisoned)
  }
}

/// Create the record of a child invocation, then drive it.
fn run_invocation(
  inner: Arc<Inner>,
  id: InvocationId,
  input: TaskInput,
  options: InvocationOptions,
  cancel: CancellationToken,
) -> BoxFuture<'static, InvocationResult> {
  async move {
    inner
      .store
      .create(TaskInvocation::new(id.clone(), input.clone()))
      .await?;
    drive_invocation(inner, id, input, options, cancel).await
  }
  .boxed()
}

/// Run attempts until one succeeds or the policy gives up, then record the
/// terminal status and archive the record.
fn drive_invocation(
  inner: Arc<Inner>,
  id: InvocationId,
  input: TaskInput,
  options: InvocationOptions,
  cancel: CancellationToken,
) -> BoxFuture<'static, InvocationResult> {
  let span = info_span!("invocation", invocation_id = %id);
  async move {
    info!(
      text = %input.text,
      delay_secs = input.delay.as_secs_f64(),
      child_tasks = input.child_task_count,
      child_activities = input.child_activity_count,
      "invocation_started"
    );
    inner.notifier.notify(ExecutionEvent::InvocationStarted {
      invocation_id: id.clone(),
    });

    let result = run_attempts(&inner, &id, &input, &options, &cancel).await;

    let recorded = match &result {
      Ok(output) => {
        info!(output = %output.text, "invocation_completed");
        inner.notifier.notify(ExecutionEvent::InvocationCompleted {
          invocation_id: id.clone(),
          output: output.clone(),
        });
        inner.store.complete(&id, output.clone()).await
      }
      Err(err) => {
        let status = err.terminal_status();
        let message = err.chain();
        match err {
          InvocationError::Cancelled { .. } => warn!(%status, error = %message, "invocation_failed"),
          _ => error!(%status, error = %message, "invocation_failed"),
        }
        inner.notifier.notify(ExecutionEvent::InvocationFailed {
          invocation_id: id.clone(),
          status,
          error: message.clone(),
        });
        inner.store.fail(&id, status, message).await
      }
    };

    match recorded {
      Ok(()) => {
        if let Err(err) = inner.store.archive(&id).await {
          warn!(error = %err, "failed to archive invocation");
        }
      }
      Err(err) => warn!(error = %err, "failed to record terminal status"),
    }

    result
  }
  .instrument(span)
  .boxed()
}

async fn run_attempts(
  inner: &Arc<Inner>,
  id: &InvocationId,
  input: &TaskInput,
  options: &InvocationOptions,
  cancel: &CancellationToken,
) -> InvocationResult {
  let mut attempt_start = Instant::now();
  let execution_deadline = deadline_after(attempt_start, options.execution_timeout);
  let mut attempt = 1;

  loop {
    if attempt > 1 {
      inner.store.begin_attempt(id, attempt).await?;
    }

    let (deadline, kind, after) = attempt_deadline(options, attempt_start, execution_deadline);
    let err = match run_attempt(inner, id, input, cancel, deadline, kind, after).await {
      Ok(output) => return Ok(output),
      Err(err) => err,
    };

    let retry = err.is_retryable()
      && options.retry_policy.allows_retry_after(attempt)
      && Instant::now() < execution_deadline;
    if !retry {
      return Err(err);
    }

    warn!(attempt, error = %err.chain(), "attempt_failed");
    inner.notifier.notify(ExecutionEvent::AttemptFailed {
      invocation_id: id.clone(),
      attempt,
      error: err.chain(),
    });

    tokio::select! {
      _ = tokio::time::sleep(options.retry_policy.interval) => {}
      _ = tokio::time::sleep_until(execution_deadline) => {
        return Err(InvocationError::Timeout {
          id: id.clone(),
          kind: TimeoutKind::Execution,
          after: options.execution_timeout,
        });
      }
      _ = cancel.cancelled() => {
        return Err(InvocationError::Cancelled { id: id.clone() });
      }
    }
    attempt += 1;
    attempt_start = Instant::now();
  }
}

/// Far enough ahead to never fire, close enough not to overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, clamped to a far-future instant when that overflows.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
  now
    .checked_add(timeout)
    .unwrap_or_else(|| now + FAR_FUTURE)
}

/// The deadline of the next attempt: the run bound if it comes first,
/// otherwise whatever is left of the execution bound.
fn attempt_deadline(
  options: &InvocationOptions,
  attempt_start: Instant,
  execution_deadline: Instant,
) -> (Instant, TimeoutKind, Duration) {
  if let Some(run_timeout) = options.run_timeout {
    let run_deadline = deadline_after(attempt_start, run_timeout);
    if run_deadline <= execution_deadline {
      return (run_deadline, TimeoutKind::Run, run_timeout);
    }
  }
  (
    execution_deadline,
    TimeoutKind::Execution,
    options.execution_timeout,
  )
}

/// One attempt under a deadline.
///
/// On deadline or cancellation the attempt's children are cancelled and
/// drained before returning, so nothing outlives its parent.
async fn run_attempt(
  inner: &Arc<Inner>,
  id: &InvocationId,
  input: &TaskInput,
  cancel: &CancellationToken,
  deadline: Instant,
  kind: TimeoutKind,
  after: Duration,
) -> InvocationResult {
  let ctx = AttemptContext {
    inner: inner.clone(),
    id: id.clone(),
    cancel: cancel.child_token(),
  };

  let run = inner.definition.run(&ctx, input);
  tokio::pin!(run);

  let stopped = tokio::select! {
    biased;
    result = &mut run => return result,
    _ = tokio::time::sleep_until(deadline) => {
      warn!(%kind, ?after, "deadline expired, cancelling outstanding children");
      ctx.cancel.cancel();
      InvocationError::Timeout { id: id.clone(), kind, after }
    }
    _ = cancel.cancelled() => {
      debug!("cancelled, draining outstanding children");
      InvocationError::Cancelled { id: id.clone() }
    }
  };

  // A pool fault outranks the timeout or cancellation it raced with
  match run.await {
    Err(err) if err.pool_fault().is_some() => Err(err),
    _ => Err(stopped),
  }
}

/// Retry loop of one activity child.
#[instrument(name = "activity", skip_all, fields(invocation_id = %child.invocation_id))]
async fn run_activity(
  inner: &Arc<Inner>,
  child: &ChildRef,
  input: TaskInput,
  cancel: &CancellationToken,
) -> Result<serde_json::Value, InvocationError> {
  let mut attempt = 1;

  loop {
    info!(attempt, "activity_started");
    let job = activity_job(
      inner.activity.clone(),
      &child.invocation_id,
      input.clone(),
      child.timeout,
    );

    let err = match inner.pool.run(job, cancel.clone()).await {
      Ok(value) => {
        info!(attempt, result = %value, "activity_completed");
        return Ok(value);
      }
      Err(err) => InvocationError::from_pool(&child.invocation_id, err),
    };

    if !err.is_retryable() || !child.retry_policy.allows_retry_after(attempt) {
      return Err(err);
    }

    warn!(attempt, error = %err, "attempt_failed");
    inner.notifier.notify(ExecutionEvent::AttemptFailed {
      invocation_id: child.invocation_id.clone(),
      attempt,
      error: err.to_string(),
    });

    tokio::select! {
      _ = tokio::time::sleep(child.retry_policy.interval) => {}
      _ = cancel.cancelled() => {
        return Err(InvocationError::Cancelled { id: child.invocation_id.clone() });
      }
    }
    attempt += 1;
  }
}

/// What a running attempt sees of the orchestrator.
struct AttemptContext {
  inner: Arc<Inner>,
  id: InvocationId,
  cancel: CancellationToken,
}

#[async_trait]
impl InvocationContext for AttemptContext {
  fn invocation_id(&self) -> &InvocationId {
    &self.id
  }

  fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }

  async fn enter(&self, status: InvocationStatus) -> Result<(), InvocationError> {
    self.inner.store.advance(&self.id, status).await?;
    debug!(invocation_id = %self.id, %status, "phase entered");
    self.inner.notifier.notify(ExecutionEvent::PhaseEntered {
      invocation_id: self.id.clone(),
      status,
    });
    Ok(())
  }

  async fn record_children(&self, children: &[ChildRef]) -> Result<(), InvocationError> {
    self
      .inner
      .store
      .set_children(&self.id, children.to_vec())
      .await?;
    Ok(())
  }

  async fn run_activity(
    &self,
    child: &ChildRef,
    input: TaskInput,
  ) -> Result<serde_json::Value, InvocationError> {
    run_activity(&self.inner, child, input, &self.cancel).await
  }

  async fn run_task(
    &self,
    child: &ChildRef,
    input: TaskInput,
  ) -> Result<TaskOutput, InvocationError> {
    run_invocation(
      self.inner.clone(),
      child.invocation_id.clone(),
      input,
      InvocationOptions::for_child(child.timeout, child.retry_policy),
      self.cancel.child_token(),
    )
    .await
  }

  async fn resolve_child(
    &self,
    child: &ChildRef,
    result: ChildResult,
  ) -> Result<(), InvocationError> {
    self
      .inner
      .store
      .resolve_child(&self.id, child.kind, child.index, result)
      .await?;
    Ok(())
  }

  fn notify(&self, event: ExecutionEvent) {
    self.inner.notifier.notify(event);
  }
}
