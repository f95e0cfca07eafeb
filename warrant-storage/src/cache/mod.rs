//! Read-through cache for materialized expressions.
//!
//! Keys embed a namespace version so a format change can be rolled out by
//! bumping the version instead of flushing. Values are the JSON encoding of
//! a [`SubjectActionExpression`](warrant_core::SubjectActionExpression), or
//! an empty value meaning "confirmed absent".
//!
//! # Example
//!
//! ```ignore
//! let cache = ExpressionCache::new(store, Arc::new(InMemoryCacheBackend::new()), CacheConfig::from_env())
//!     .with_notifier(producer);
//!
//! let result = cache.batch_get(&[(7, 3), (8, 3)]).await?;
//! for expression in result.hits {
//!     // evaluate expression.expression against the resource
//! }
//! ```

pub mod key;
pub mod lmdb_backend;
pub mod memory;
pub mod read_through;
pub mod singleflight;
pub mod traits;

pub use key::SubjectActionKey;
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory::InMemoryCacheBackend;
pub use read_through::{
    BatchGetResult, CacheConfig, ExpressionCache, ExpressionCacheMetrics, ExpressionCacheSnapshot,
    RefreshNotifier,
};
pub use singleflight::SingleFlight;
pub use traits::{CacheBackend, CacheEntry, CacheStats};
