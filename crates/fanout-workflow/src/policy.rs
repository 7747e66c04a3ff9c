//! Named operations and the timeout/retry policy of each fan-out edge.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operation name of the recursive task.
pub const TASK_NAME: &str = "fanout.task";

/// Operation name of the leaf activity. Distinct from [`TASK_NAME`].
pub const ACTIVITY_NAME: &str = "fanout.leaf_activity";

/// Execution and run deadline of every derived child task.
pub const CHILD_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Start-to-close bound of every leaf activity.
pub const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Execution timeout of a top-level submission when the caller sets none.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How many times an invocation may run before its failure is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Total attempts, including the first one. Zero behaves like one.
  pub max_attempts: u32,
  /// Pause between a failed attempt and the next one.
  #[serde(default, with = "crate::input::secs")]
  pub interval: Duration,
}

impl RetryPolicy {
  /// A single attempt.
  pub const NO_RETRY: RetryPolicy = RetryPolicy {
    max_attempts: 1,
    interval: Duration::ZERO,
  };

  pub fn attempts(max_attempts: u32) -> Self {
    Self {
      max_attempts,
      interval: Duration::ZERO,
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn effective_attempts(&self) -> u32 {
    self.max_attempts.max(1)
  }

  /// Whether another attempt may follow attempt number `attempt` (1-based).
  pub fn allows_retry_after(&self, attempt: u32) -> bool {
    attempt < self.effective_attempts()
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::NO_RETRY
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_no_retry_is_terminal_after_first_attempt() {
    assert!(!RetryPolicy::NO_RETRY.allows_retry_after(1));
    assert_eq!(RetryPolicy::default(), RetryPolicy::NO_RETRY);
  }

  #[test]
  fn test_zero_attempts_behaves_like_one() {
    let policy = RetryPolicy::attempts(0);
    assert_eq!(policy.effective_attempts(), 1);
    assert!(!policy.allows_retry_after(1));
  }

  #[test]
  fn test_three_attempts() {
    let policy = RetryPolicy::attempts(3);
    assert!(policy.allows_retry_after(1));
    assert!(policy.allows_retry_after(2));
    assert!(!policy.allows_retry_after(3));
  }

  #[test]
  fn test_activity_and_task_names_differ() {
    assert_ne!(TASK_NAME, ACTIVITY_NAME);
  }
}
