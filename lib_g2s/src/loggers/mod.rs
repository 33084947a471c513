/// Installs the global `tracing` subscriber: console plus rolling JSON file.
pub mod logging;

pub use logging::{init_logging, LoggingError, LoggingHandle, LoggingOptions};
