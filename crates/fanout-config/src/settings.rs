use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete settings for one `fanout` process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub transport: TransportSettings,
  pub worker: WorkerSettings,
}

/// Where and under which names invocations are submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
  /// Connection URI, e.g. `memory://local`.
  pub uri: String,
  pub namespace: String,
  /// Task queue the worker serves and `trigger` submits to.
  pub queue_name: String,
  /// Prefix of generated top-level invocation ids.
  pub task_prefix: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tls: Option<TlsSettings>,
}

impl Default for TransportSettings {
  fn default() -> Self {
    Self {
      uri: "memory://local".to_string(),
      namespace: "default".to_string(),
      queue_name: "fanout".to_string(),
      task_prefix: "fanout".to_string(),
      tls: None,
    }
  }
}

/// Client certificate and private key locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsSettings {
  pub cert_path: PathBuf,
  pub key_path: PathBuf,
}

/// Worker-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
  /// Number of execution slots for leaf activities.
  pub pool_size: usize,
  /// Period of the diagnostics log line. Disabled when unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub diagnostics_interval_secs: Option<u64>,
}

impl Default for WorkerSettings {
  fn default() -> Self {
    Self {
      pool_size: 1,
      diagnostics_interval_secs: None,
    }
  }
}

/// Certificate and key bytes read from [`TlsSettings`].
pub struct TlsMaterial {
  pub cert: Vec<u8>,
  pub key: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TlsMaterial")
      .field("cert", &format_args!("{} bytes", self.cert.len()))
      .field("key", &"<redacted>")
      .finish()
  }
}

impl Settings {
  /// Load settings from a JSON file. Missing sections fall back to defaults.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Check every field that must be usable before work begins.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let transport = &self.transport;

    if transport.uri.trim().is_empty() {
      return Err(ConfigError::Missing { field: "uri" });
    }
    match transport.uri.split_once("://") {
      Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {}
      _ => {
        return Err(ConfigError::Invalid {
          field: "uri",
          message: format!("'{}' is not of the form scheme://address", transport.uri),
        });
      }
    }

    for (field, value) in [
      ("namespace", &transport.namespace),
      ("queue_name", &transport.queue_name),
      ("task_prefix", &transport.task_prefix),
    ] {
      if value.trim().is_empty() {
        return Err(ConfigError::Missing { field });
      }
    }

    if self.worker.pool_size == 0 {
      return Err(ConfigError::Invalid {
        field: "pool_size",
        message: "must be at least 1".to_string(),
      });
    }

    if self.worker.diagnostics_interval_secs == Some(0) {
      return Err(ConfigError::Invalid {
        field: "diagnostics_interval_secs",
        message: "must be at least 1".to_string(),
      });
    }

    Ok(())
  }
}

impl TlsSettings {
  /// Pair up optional certificate and key paths.
  ///
  /// Both or neither must be given.
  pub fn from_parts(
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
  ) -> Result<Option<Self>, ConfigError> {
    match (cert_path, key_path) {
      (Some(cert_path), Some(key_path)) => Ok(Some(Self {
        cert_path,
        key_path,
      })),
      (None, None) => Ok(None),
      (Some(_), None) => Err(ConfigError::Missing {
        field: "tls_key_path",
      }),
      (None, Some(_)) => Err(ConfigError::Missing {
        field: "tls_cert_path",
      }),
    }
  }

  /// Read the certificate and key.
  pub fn load(&self) -> Result<TlsMaterial, ConfigError> {
    let read = |path: &Path| {
      std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
      })
    };

    let cert = read(&self.cert_path)?;
    let key = read(&self.key_path)?;

    if cert.is_empty() {
      return Err(ConfigError::Invalid {
        field: "tls_cert_path",
        message: format!("{} is empty", self.cert_path.display()),
      });
    }
    if key.is_empty() {
      return Err(ConfigError::Invalid {
        field: "tls_key_path",
        message: format!("{} is empty", self.key_path.display()),
      });
    }

    Ok(TlsMaterial { cert, key })
  }
}
