use std::path::PathBuf;

/// Invalid or missing settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// A required field is empty.
  #[error("missing required setting '{field}'")]
  Missing { field: &'static str },

  /// A field holds a value that cannot be used.
  #[error("invalid setting '{field}': {message}")]
  Invalid { field: &'static str, message: String },

  /// The settings file or TLS material could not be read.
  #[error("failed to read {}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The settings file is not valid JSON for [`crate::Settings`].
  #[error("failed to parse settings file {}", path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}
