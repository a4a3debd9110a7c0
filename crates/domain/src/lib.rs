//! Sitefence Domain Layer
pub mod config;
pub mod errors;
pub mod event;
pub mod wire;

pub use config::{BlockerConfig, CliOverrides, Config, LoggingConfig, ProxyConfig};
pub use errors::{BlockerError, ConfigError, ProxyError};
pub use event::EventRecord;
