//! Fanout Config
//!
//! Settings consumed by the `fanout` binary before it builds an orchestrator:
//! - [`TransportSettings`]: where submissions go (URI, namespace, queue, id prefix)
//! - [`TlsSettings`]: client certificate and key locations
//! - [`WorkerSettings`]: pool size and diagnostics cadence
//!
//! Settings can be loaded from a JSON file and are then overridden field by
//! field by the CLI. [`Settings::validate`] must pass before any invocation is
//! submitted. The runtime crates never read settings themselves; the binary
//! translates them into explicit runtime configuration.

mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{Settings, TlsMaterial, TlsSettings, TransportSettings, WorkerSettings};
