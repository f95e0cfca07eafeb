//! Background Jobs for the WARRANT worker
//!
//! This module contains background tasks that run periodically:
//!
//! - `transfer`: Merges change events into recompute batches and publishes them
//! - `checker`: Republishes batches whose queue message was lost
//!
//! # Usage
//!
//! Background jobs are spawned during worker startup:
//!
//! ```ignore
//! use warrant_pipeline::jobs::{transfer_task, TransferConfig};
//! use tokio::sync::watch;
//!
//! // Create shutdown signal
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//! // Spawn transfer task
//! let handle = tokio::spawn(transfer_task(
//!     Arc::clone(&store),
//!     Arc::clone(&queue),
//!     TransferConfig::default(),
//!     shutdown_rx,
//! ));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

pub mod checker;
pub mod transfer;

// Re-export commonly used types
pub use checker::{check_pending_once, checker_task, CheckerConfig, CheckerMetrics, CheckerSnapshot};
pub use transfer::{
    build_batches, merge_events, transfer_once, transfer_task, TransferConfig, TransferMetrics,
    TransferReport, TransferSnapshot,
};
