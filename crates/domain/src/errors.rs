use thiserror::Error;

pub use crate::config::ConfigError;

/// Fatal proxy failures. Per-exchange socket errors are absorbed at the
/// point of occurrence and never reach this type.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to bind {transport} listener on {addr}: {reason}")]
    Bind {
        transport: &'static str,
        addr: String,
        reason: String,
    },

    #[error("Failed to create event log {0}: {1}")]
    LogCreate(String, String),

    #[error("Failed to write output artifact {0}: {1}")]
    ArtifactWrite(String, String),
}

/// Blocker failures that must stop the run. Packet filter failures are not
/// among them: they are carried as data in every status snapshot instead.
#[derive(Error, Debug)]
pub enum BlockerError {
    #[error("Failed to write output artifact {0}: {1}")]
    ArtifactWrite(String, String),

    #[error("Failed to read event log {0}: {1}")]
    LogRead(String, String),
}
