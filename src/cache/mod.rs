mod key;
mod store;

use thiserror::Error;

pub use key::{CacheKey, SENTINEL_KEY};
pub use store::ImageStore;

/// Outcome taxonomy for store operations. `NotFound` is ordinary control flow (it is what
/// triggers a read-through fetch); everything else is a storage failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache entry for key")]
    NotFound,
    #[error("cache {op} failed for key {key}")]
    Io {
        key: String,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(key: &CacheKey, op: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.as_str().to_string(),
            op,
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
