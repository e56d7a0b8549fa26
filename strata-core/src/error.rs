//! Error types for Strata operations

use crate::SyncLayer;
use thiserror::Error;

/// Persistent store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Transaction failed on table {table}: {reason}")]
    TransactionFailed { table: String, reason: String },

    #[error("Serialization failed for key {key}: {reason}")]
    SerializationFailed { key: String, reason: String },

    #[error("Deserialization failed for key {key}: {reason}")]
    DeserializationFailed { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Store writer closed")]
    WriterClosed,

    #[error("Injected write failure: {reason}")]
    WriteRejected { reason: String },
}

/// Remote API errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Request to {endpoint} failed with status {status}: {message}")]
    RequestFailed {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Transport error calling {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Response for {layer:?} discarded: cache generation moved from {started} to {current}")]
    StaleGeneration {
        layer: SyncLayer,
        started: u64,
        current: u64,
    },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("No draft for {entity_code}:{entity_id}")]
    DraftNotFound {
        entity_code: String,
        entity_id: String,
    },

    #[error("Unknown optimistic operation {op_id}")]
    UnknownOperation { op_id: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Strata errors.
#[derive(Debug, Clone, Error)]
pub enum StrataError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl StrataError {
    /// True for failures the next scheduled sync retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StrataError::Remote(RemoteError::Transport { .. })
                | StrataError::Remote(RemoteError::RequestFailed { .. })
                | StrataError::Storage(_)
        )
    }
}

/// Result type alias for Strata operations.
pub type StrataResult<T> = Result<T, StrataError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_transaction_failed() {
        let err = StorageError::TransactionFailed {
            table: "entity_instances".to_string(),
            reason: "map full".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("entity_instances"));
        assert!(msg.contains("map full"));
    }

    #[test]
    fn test_remote_error_display_request_failed() {
        let err = RemoteError::RequestFailed {
            endpoint: "/api/v1/entity-links".to_string(),
            status: 503,
            message: "unavailable".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("503"));
        assert!(msg.contains("/api/v1/entity-links"));
    }

    #[test]
    fn test_validation_error_display_draft_not_found() {
        let err = ValidationError::DraftNotFound {
            entity_code: "task".to_string(),
            entity_id: "t1".to_string(),
        };
        assert_eq!(format!("{}", err), "No draft for task:t1");
    }

    #[test]
    fn test_strata_error_from_variants() {
        let storage = StrataError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, StrataError::Storage(_)));

        let remote = StrataError::from(RemoteError::Transport {
            endpoint: "/x".to_string(),
            reason: "reset".to_string(),
        });
        assert!(matches!(remote, StrataError::Remote(_)));

        let validation = StrataError::from(ValidationError::RequiredFieldMissing {
            field: "code".to_string(),
        });
        assert!(matches!(validation, StrataError::Validation(_)));

        let config = StrataError::from(ConfigError::MissingRequired {
            field: "api_base_url".to_string(),
        });
        assert!(matches!(config, StrataError::Config(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StrataError::from(RemoteError::Transport {
            endpoint: "/x".to_string(),
            reason: "timeout".to_string(),
        })
        .is_transient());
        assert!(StrataError::from(StorageError::WriterClosed).is_transient());
        assert!(!StrataError::from(RemoteError::StaleGeneration {
            layer: SyncLayer::EntityInstances,
            started: 1,
            current: 2,
        })
        .is_transient());
        assert!(!StrataError::from(ValidationError::UnknownOperation {
            op_id: "x".to_string(),
        })
        .is_transient());
    }
}
