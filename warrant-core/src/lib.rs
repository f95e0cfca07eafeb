//! WARRANT Core - Domain Types
//!
//! Pure data structures for the RBAC materialization pipeline, plus the one
//! pure algorithm every other crate shares: aggregate grant state to
//! boolean expression. No I/O lives here.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod aggregate;
pub mod constants;
pub mod error;
pub mod event;
pub mod expression;
pub mod lock;

pub use aggregate::{
    ActionScope, GroupResource, Membership, ResourceMap, ResourceType, SubjectActionGroupResource,
};
pub use error::{
    CacheError, ConfigError, EntityKind, LockError, QueueError, StorageError, ValidationError,
    WarrantError, WarrantResult,
};
pub use event::{
    BatchStatus, BatchStatusParseError, GroupAlterEvent, SubjectActionAlterMessage,
    SubjectActionGroupMessage,
};
pub use expression::{synthesize, Expression, SubjectActionExpression};
pub use lock::{Acquired, Lock, LockData, LockState};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Primary key of a subject (user or department).
pub type SubjectPk = i64;

/// Primary key of an action.
pub type ActionPk = i64;

/// Primary key of a group.
pub type GroupPk = i64;

/// Primary key of a resource type.
pub type ResourceTypePk = i64;

/// Unix timestamp in seconds. `0` means "no expiry recorded".
pub type UnixSeconds = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Materialization is keyed by the (subject, action) pair.
pub type SubjectActionPair = (SubjectPk, ActionPk);

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> UnixSeconds {
    Utc::now().timestamp()
}
