//! Change events and recompute batches.
//!
//! ```text
//! GroupAlterEvent ──transfer──→ SubjectActionAlterMessage ──queue──→ handler
//!   (per group)                   (per (subject, action) set)
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::{ActionPk, GroupPk, SubjectPk, Timestamp};

// ============================================================================
// CHANGE EVENT
// ============================================================================

/// "Something changed for this group that may affect these subjects/actions."
///
/// Append-only; deleted once transfer merges it into a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAlterEvent {
    pub uuid: Uuid,
    pub group_pk: GroupPk,
    pub subject_pks: Vec<SubjectPk>,
    pub action_pks: Vec<ActionPk>,
    pub created_at: Timestamp,
}

impl GroupAlterEvent {
    /// Build an event, sorting and deduplicating the PK lists.
    pub fn new(
        group_pk: GroupPk,
        subject_pks: impl IntoIterator<Item = SubjectPk>,
        action_pks: impl IntoIterator<Item = ActionPk>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            uuid: crate::new_entity_id(),
            group_pk,
            subject_pks: sorted_unique(subject_pks),
            action_pks: sorted_unique(action_pks),
            created_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subject_pks.is_empty() || self.action_pks.is_empty()
    }

    /// Expand into `(group, action, subject)` triples.
    pub fn triples(&self) -> impl Iterator<Item = (GroupPk, ActionPk, SubjectPk)> + '_ {
        self.action_pks.iter().flat_map(move |&action_pk| {
            self.subject_pks
                .iter()
                .map(move |&subject_pk| (self.group_pk, action_pk, subject_pk))
        })
    }
}

fn sorted_unique<T: Ord>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    items.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

// ============================================================================
// BATCH STATUS
// ============================================================================

/// Lifecycle of a recompute batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Committed but not yet handed to the queue.
    Pending,
    /// A handler has claimed the current delivery.
    Processing,
    /// Token published to the queue.
    Pushed,
}

impl BatchStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Pushed => "pushed",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, BatchStatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "pushed" => Ok(BatchStatus::Pushed),
            _ => Err(BatchStatusParseError(s.to_string())),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for BatchStatus {
    type Err = BatchStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid batch status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatusParseError(pub String);

impl fmt::Display for BatchStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid batch status: {}", self.0)
    }
}

impl std::error::Error for BatchStatusParseError {}

// ============================================================================
// BATCH
// ============================================================================

/// One unit of recompute work: the groups touched for a (subject, action).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectActionGroupMessage {
    pub subject_pk: SubjectPk,
    pub action_pk: ActionPk,
    pub group_pks: Vec<GroupPk>,
}

/// Durable, queue-referenced batch of recompute entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectActionAlterMessage {
    pub uuid: Uuid,
    pub messages: Vec<SubjectActionGroupMessage>,
    pub status: BatchStatus,
    pub check_count: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SubjectActionAlterMessage {
    /// A fresh pending batch.
    pub fn new(messages: Vec<SubjectActionGroupMessage>, now: Timestamp) -> Self {
        Self {
            uuid: crate::new_entity_id(),
            messages,
            status: BatchStatus::Pending,
            check_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The string carried on the queue.
    pub fn token(&self) -> String {
        self.uuid.to_string()
    }

    /// Parse a queue token back into a batch id.
    pub fn parse_token(token: &str) -> Result<Uuid, ValidationError> {
        Uuid::parse_str(token.trim()).map_err(|_| ValidationError::InvalidToken {
            token: token.to_string(),
        })
    }
}
