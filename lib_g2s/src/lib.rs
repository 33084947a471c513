//! # lib_g2s
//!
//! G2S (Game to System) protocol client core for an EGM. Each folder is a
//! cargo feature:
//!
//! - `core`: the protocol engine (commands, dispatch, sessions, per-host
//!   queues, host registry).
//! - `configs`: protocol settings and their validation.
//! - `loggers`: `tracing` subscriber setup for binaries.
//! - `full`: all of the above.

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "loggers")]
pub mod loggers;
