//! # Configuration Modules
//!
//! This module aggregates the configuration providers used by the protocol
//! core. Every tunable the engine consumes (retry budget, session timeout,
//! time-to-live, queue depth) arrives through here and is handed to the
//! components as constructor arguments. Nothing reads configuration from a
//! process-wide location.

/// Protocol defaults loaded from JSON, validated, and converted to runtime settings.
pub mod protocol;

pub use protocol::{ConfigError, ProtocolConfig, ProtocolSettings};
