//! WARRANT Pipeline - RBAC Materialization Workers
//!
//! The asynchronous half of the RBAC engine: group membership and grant
//! changes become change events, events are merged into batches, and
//! handlers recompute each affected `(subject, action)` expression under a
//! distributed lock before invalidating the cached copy.
//!
//! ```text
//! ChangeProducer -> change events -> transfer_task -> batches + queue
//!                                                        |
//!                    ExpressionCache <- RecomputeHandler <- consumer_task
//! ```

pub mod config;
pub mod consumer;
pub mod handler;
pub mod jobs;
pub mod locker;
pub mod metrics;
pub mod producer;
pub mod telemetry;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use consumer::{consume_one, consumer_task, ConsumeOutcome, ConsumerConfig, ConsumerMetrics};
pub use handler::{HandleOutcome, HandlerConfig, RecomputeHandler, Recomputed};
pub use jobs::{
    check_pending_once, checker_task, transfer_once, transfer_task, CheckerConfig, TransferConfig,
};
pub use locker::{DistributedLocker, LockConfig, LockGuard};
pub use producer::{build_events, ChangeProducer, ProducerConfig};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
