//! Worker configuration, gathered from `WARRANT_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use warrant_core::constants::DEFAULT_QUEUE_VISIBILITY_SECS;
use warrant_storage::{CacheConfig, PgConfig};

use crate::consumer::ConsumerConfig;
use crate::handler::HandlerConfig;
use crate::jobs::{CheckerConfig, TransferConfig};
use crate::locker::LockConfig;
use crate::producer::ProducerConfig;
use crate::telemetry::TelemetryConfig;

/// Default LMDB map size in megabytes.
pub const DEFAULT_LMDB_MAX_MB: usize = 512;

/// Everything the `warrant-worker` binary needs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db: PgConfig,
    pub cache: CacheConfig,
    /// LMDB directory; `None` selects the in-memory cache backend.
    pub lmdb_path: Option<PathBuf>,
    pub lmdb_max_mb: usize,
    pub queue_visibility: Duration,
    pub producer: ProducerConfig,
    pub transfer: TransferConfig,
    pub checker: CheckerConfig,
    pub lock: LockConfig,
    pub handler: HandlerConfig,
    pub consumer: ConsumerConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db: PgConfig::default(),
            cache: CacheConfig::default(),
            lmdb_path: None,
            lmdb_max_mb: DEFAULT_LMDB_MAX_MB,
            queue_visibility: Duration::from_secs(DEFAULT_QUEUE_VISIBILITY_SECS),
            producer: ProducerConfig::default(),
            transfer: TransferConfig::default(),
            checker: CheckerConfig::default(),
            lock: LockConfig::default(),
            handler: HandlerConfig::default(),
            consumer: ConsumerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load every section from the environment.
    ///
    /// # Environment Variables
    /// - `WARRANT_LMDB_PATH`: LMDB cache directory (default: unset, in-memory cache)
    /// - `WARRANT_LMDB_MAX_MB`: LMDB map size (default: 512)
    /// - `WARRANT_QUEUE_VISIBILITY_SECS`: Queue redelivery timeout (default: 300)
    ///
    /// plus the variables read by each section's own `from_env`.
    pub fn from_env() -> Self {
        let lmdb_path = std::env::var("WARRANT_LMDB_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let lmdb_max_mb = std::env::var("WARRANT_LMDB_MAX_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_LMDB_MAX_MB);

        let queue_visibility = Duration::from_secs(
            std::env::var("WARRANT_QUEUE_VISIBILITY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_QUEUE_VISIBILITY_SECS),
        );

        let cache = CacheConfig::from_env();
        let mut lock = LockConfig::from_env();
        lock.namespace_version = cache.version.clone();

        Self {
            db: PgConfig::from_env(),
            cache,
            lmdb_path,
            lmdb_max_mb,
            queue_visibility,
            producer: ProducerConfig::from_env(),
            transfer: TransferConfig::from_env(),
            checker: CheckerConfig::from_env(),
            lock,
            handler: HandlerConfig::from_env(),
            consumer: ConsumerConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checker_and_handler_share_delivery_limit_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.checker.max_check_count, config.handler.max_check_count);
        assert_eq!(config.lock.namespace_version, config.cache.version);
        assert!(config.lmdb_path.is_none());
    }
}
