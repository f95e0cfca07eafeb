//! Error types for WARRANT operations

use std::fmt;
use thiserror::Error;

/// Kinds of records the pipeline reads or owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    ChangeEvent,
    Batch,
    Aggregate,
    Expression,
    Membership,
    Grant,
    Action,
    ResourceType,
    Lock,
    QueueMessage,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::ChangeEvent => "change_event",
            EntityKind::Batch => "batch",
            EntityKind::Aggregate => "aggregate",
            EntityKind::Expression => "expression",
            EntityKind::Membership => "membership",
            EntityKind::Grant => "grant",
            EntityKind::Action => "action",
            EntityKind::ResourceType => "resource_type",
            EntityKind::Lock => "lock",
            EntityKind::QueueMessage => "queue_message",
        };
        f.write_str(name)
    }
}

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: EntityKind, key: String },

    #[error("Connection pool error: {reason}")]
    Pool { reason: String },

    #[error("Query on {kind} failed: {reason}")]
    QueryFailed { kind: EntityKind, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Corrupt {kind} record {key}: {reason}")]
    Corrupt {
        kind: EntityKind,
        key: String,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Cache backend errors. The read path treats these as misses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend unavailable: {reason}")]
    Backend { reason: String },

    #[error("Cache value for {key} could not be encoded: {reason}")]
    Encode { key: String, reason: String },

    #[error("Cache transaction error: {reason}")]
    Transaction { reason: String },
}

/// Distributed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// Lock was held by someone else until the acquire deadline passed.
    #[error("Lock {key} not obtained after {waited_ms}ms")]
    NotObtained { key: String, waited_ms: u64 },

    #[error("Lock backend failed for {key}: {reason}")]
    Backend { key: String, reason: String },
}

/// Work queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Publish failed: {reason}")]
    PublishFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Acknowledge of delivery {delivery_id} failed: {reason}")]
    AckFailed { delivery_id: i64, reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid batch token: {token}")]
    InvalidToken { token: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
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

/// Master error type for all WARRANT errors.
#[derive(Debug, Clone, Error)]
pub enum WarrantError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl WarrantError {
    /// Lock contention: the work was not attempted and should be redelivered.
    pub fn is_need_retry(&self) -> bool {
        matches!(self, WarrantError::Lock(LockError::NotObtained { .. }))
    }

    /// Infrastructure unavailability, safe to retry later.
    pub fn is_transient(&self) -> bool {
        match self {
            WarrantError::Storage(StorageError::Pool { .. })
            | WarrantError::Storage(StorageError::QueryFailed { .. })
            | WarrantError::Storage(StorageError::TransactionFailed { .. })
            | WarrantError::Cache(_)
            | WarrantError::Queue(_)
            | WarrantError::Lock(LockError::Backend { .. }) => true,
            _ => self.is_need_retry(),
        }
    }
}

/// Result type alias for WARRANT operations.
pub type WarrantResult<T> = Result<T, WarrantError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            kind: EntityKind::Batch,
            key: "0190a7b2".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("batch not found"));
        assert!(msg.contains("0190a7b2"));
    }

    #[test]
    fn test_lock_error_display_not_obtained() {
        let err = LockError::NotObtained {
            key: "warrant:1:lock:subject_action:7:3".to_string(),
            waited_ms: 1500,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("not obtained"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn test_need_retry_only_for_lock_contention() {
        let contended = WarrantError::from(LockError::NotObtained {
            key: "k".to_string(),
            waited_ms: 10,
        });
        assert!(contended.is_need_retry());
        assert!(contended.is_transient());

        let backend = WarrantError::from(LockError::Backend {
            key: "k".to_string(),
            reason: "connection reset".to_string(),
        });
        assert!(!backend.is_need_retry());
        assert!(backend.is_transient());
    }

    #[test]
    fn test_validation_is_not_transient() {
        let err = WarrantError::from(ValidationError::InvalidToken {
            token: "nope".to_string(),
        });
        assert!(!err.is_transient());
        assert!(!err.is_need_retry());
    }

    #[test]
    fn test_warrant_error_from_variants() {
        let storage = WarrantError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, WarrantError::Storage(_)));

        let cache = WarrantError::from(CacheError::Backend {
            reason: "down".to_string(),
        });
        assert!(matches!(cache, WarrantError::Cache(_)));

        let queue = WarrantError::from(QueueError::PublishFailed {
            reason: "closed".to_string(),
        });
        assert!(matches!(queue, WarrantError::Queue(_)));

        let config = WarrantError::from(ConfigError::MissingRequired {
            field: "WARRANT_DB_HOST".to_string(),
        });
        assert!(matches!(config, WarrantError::Config(_)));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "WARRANT_LOG_FORMAT".to_string(),
            value: "xml".to_string(),
            reason: "expected json or pretty".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("WARRANT_LOG_FORMAT"));
        assert!(msg.contains("xml"));
    }
}
