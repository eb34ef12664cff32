// Cache Module
// Keyed artifact store shared across runs, with SIEVE eviction and key templates

pub mod key;
pub mod sieve;
pub mod store;

pub use key::{render_key, KeyContext};
pub use sieve::{CacheStats, SieveIndex};
pub use store::{CacheConfig, CacheEntry, CacheManager};

use std::io;
use thiserror::Error;

/// Errors that can occur in the cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid cache metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    Key(String),

    #[error("Invalid cache capacity: {0}")]
    Capacity(String),

    #[error("Cache write failed: {0}")]
    Write(String),
}
