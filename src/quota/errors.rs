use std::path::PathBuf;

use crate::quota::config::ConfigError;
use crate::quota::types::ClientType;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The operation lost a race with a clear, reset or shutdown, or was cancelled by the caller.
    #[error("operation aborted")]
    Aborted,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt {client} data in {path}: {reason}")]
    Corrupt {
        client: ClientType,
        path: PathBuf,
        reason: String,
    },

    #[error("Invalid principal: {0}")]
    InvalidPrincipal(String),

    #[error("Unknown client type: {0}")]
    UnknownClient(String),

    #[error("Client type {0} is not enabled")]
    ClientDisabled(ClientType),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Metadata store error: {0}")]
    Metadata(#[source] anyhow::Error),

    #[error("Quota manager channel closed")]
    ChannelClosed,

    #[error("Quota manager is not running")]
    NotRunning,

    #[error("Internal quota manager error: {0}")]
    Internal(String),
}

impl QuotaError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QuotaError::Io { path: path.into(), source }
    }

    /// True when the failure only means "storage is not available right now"
    /// because a clear or reset won the race.
    pub fn is_abort(&self) -> bool {
        matches!(self, QuotaError::Aborted)
    }
}

pub type QuotaResult<T> = Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_classified_separately() {
        assert!(QuotaError::Aborted.is_abort());
        let io = QuotaError::io("/tmp/x", std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!io.is_abort());
        assert!(io.to_string().contains("/tmp/x"));
        assert!(io.to_string().contains("boom"));
    }

    #[test]
    fn corrupt_message_names_client() {
        let e = QuotaError::Corrupt {
            client: ClientType::IndexedDb,
            path: PathBuf::from("/s/idb"),
            reason: "bad schema".into(),
        };
        assert_eq!(e.to_string(), "corrupt idb data in /s/idb: bad schema");
    }
}
