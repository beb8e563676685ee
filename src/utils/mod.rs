//! Shared helpers: logging setup, shutdown signalling, time and locks

pub mod lock;
pub mod logging;
pub mod signal;
pub mod time;

#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config};
pub use signal::{Shutdown, ShutdownSignal};
pub use time::{current_timestamp, current_timestamp_duration, current_timestamp_millis};
