use common::ProbeMethod;

/// Failures raised by the measurement store.
///
/// Transient contention is retried inside the store; everything that reaches
/// a caller as `Fatal` means measurement for the affected writer has to halt.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("fatal store failure: {0}")]
    Fatal(String),
    #[error("store contention: {0}")]
    Transient(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(ffi, _) => match ffi.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    StoreError::Transient(e.to_string())
                }
                _ => StoreError::Fatal(e.to_string()),
            },
            _ => StoreError::Fatal(e.to_string()),
        }
    }
}

/// Failures raised by platform adapters.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The platform bridge is not linked; scheduling halts until it returns.
    #[error("platform not linked")]
    Unavailable,
    /// One probe failed to send. Per-cycle; no measurement row is written.
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("probe method '{}' not supported on this platform", .0.as_str())]
    UnsupportedProbeMethod(ProbeMethod),
    #[error("invalid target identifier: {0}")]
    InvalidTarget(String),
}

impl AdapterError {
    /// Human-facing message for subscriber error events. Never includes
    /// internal identifiers or backtraces.
    pub fn subscriber_message(&self) -> String {
        match self {
            AdapterError::Unavailable => "messaging platform is not linked".to_string(),
            AdapterError::ProbeFailed(_) => "probe could not be sent".to_string(),
            AdapterError::UnsupportedProbeMethod(m) => {
                format!("probe method '{}' is not supported on this platform", m.as_str())
            }
            AdapterError::InvalidTarget(_) => "target identifier is not valid".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        assert!(matches!(StoreError::from(busy), StoreError::Transient(_)));
    }

    #[test]
    fn test_constraint_violation_maps_to_fatal() {
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("CHECK constraint failed".to_string()),
        );
        assert!(matches!(StoreError::from(constraint), StoreError::Fatal(_)));
    }

    #[test]
    fn test_subscriber_messages_hide_internals() {
        let e = AdapterError::ProbeFailed("ws send on ws://10.0.0.3:8066 failed".to_string());
        assert!(!e.subscriber_message().contains("10.0.0.3"));
    }
}
