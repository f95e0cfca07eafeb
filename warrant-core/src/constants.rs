//! Shared defaults for the pipeline.
//!
//! Component configs read `WARRANT_*` env vars and fall back to these.

/// Group PK reserved for refresh events: re-synthesize from the stored
/// aggregate without touching any group entry.
pub const REFRESH_GROUP_PK: i64 = 0;

/// Membership expiry used for memberships that never expire (2100-01-01).
pub const NEVER_EXPIRES_AT: i64 = 4_102_444_800;

// Transfer
pub const DEFAULT_TRANSFER_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TRANSFER_SAFETY_MARGIN_SECS: u64 = 30;
pub const DEFAULT_TRANSFER_PAGE_LIMIT: usize = 1000;
pub const DEFAULT_BATCH_MAX_ENTRIES: usize = 100;

// Producer
pub const DEFAULT_EVENT_SHARD_SIZE: usize = 100;

// Lock
pub const DEFAULT_LOCK_TTL_SECS: u64 = 120;
pub const DEFAULT_LOCK_DEADLINE_SECS: u64 = 180;
pub const DEFAULT_LOCK_RETRY_STEP_MS: u64 = 50;
pub const DEFAULT_LOCK_RETRY_MAX_MS: u64 = 1000;

// Handler / checker
pub const DEFAULT_MAX_CHECK_COUNT: i64 = 3;
pub const DEFAULT_CHECKER_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_CHECKER_STALE_AFTER_SECS: u64 = 300;
pub const DEFAULT_CHECKER_BATCH_LIMIT: usize = 1000;

// Cache
pub const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_CACHE_JITTER_SECS: u64 = 60;
pub const DEFAULT_CACHE_VERSION: &str = "1";

// Consumer / queue
pub const DEFAULT_CONSUMER_WORKERS: usize = 4;
pub const DEFAULT_CONSUMER_POLL_MS: u64 = 500;
pub const DEFAULT_QUEUE_VISIBILITY_SECS: u64 = 300;
