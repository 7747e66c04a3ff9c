//! Task payloads.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// Input of one task invocation.
///
/// The delay travels as fractional seconds (`delay_secs`) on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
  pub text: String,
  #[serde(rename = "delay_secs", with = "secs")]
  pub delay: Duration,
  #[serde(default)]
  pub child_task_count: u32,
  #[serde(default)]
  pub child_activity_count: u32,
}

impl TaskInput {
  /// Build an input from a delay in seconds.
  ///
  /// Negative, NaN and infinite delays are rejected.
  pub fn new(
    text: impl Into<String>,
    delay_secs: f64,
    child_task_count: u32,
    child_activity_count: u32,
  ) -> Result<Self, WorkflowError> {
    let delay = Duration::try_from_secs_f64(delay_secs)
      .map_err(|_| WorkflowError::InvalidDelay { delay_secs })?;

    Ok(Self {
      text: text.into(),
      delay,
      child_task_count,
      child_activity_count,
    })
  }

  /// Input for the `index`-th child task.
  ///
  /// Children never fan out again: both counts are forced to zero, which caps
  /// the call graph at one level below any top-level submission.
  pub fn derive_child(&self, index: u32) -> TaskInput {
    TaskInput {
      text: format!("{}-{}", self.text, index),
      delay: self.delay,
      child_task_count: 0,
      child_activity_count: 0,
    }
  }

  /// True when the invocation has nothing to fan out to.
  pub fn is_leaf(&self) -> bool {
    self.child_task_count == 0 && self.child_activity_count == 0
  }

  /// Number of children the fan-out phase will issue.
  pub fn fan_out_width(&self) -> usize {
    self.child_task_count as usize + self.child_activity_count as usize
  }
}

/// Output of a completed task invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
  pub text: String,
}

impl TaskOutput {
  /// The output depends on the delay only, never on the children.
  pub fn from_delay(delay: Duration) -> Self {
    Self {
      text: format!("{:?}s later...", delay.as_secs_f64()),
    }
  }
}

/// Serde adapter storing a [`Duration`] as fractional seconds.
pub mod secs {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(raw).map_err(|_| {
      serde::de::Error::custom(format!(
        "invalid duration {raw}: expected a finite, non-negative number of seconds"
      ))
    })
  }
}
