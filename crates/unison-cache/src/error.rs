use std::sync::Arc;

use thiserror::Error;

/// The reason a cache lookup failed.
///
/// Failures settle every caller attached to the same in-flight fetch
/// identically, so the error must be cheap to clone; fetcher failures are
/// therefore carried behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The caller's token had already fired on entry, or fired before the
    /// value was available and no other caller kept the fetch alive.
    #[error("request cancelled")]
    Cancelled,
    /// Every fetcher in the chain declined the key.
    #[error("no fetcher produced a value")]
    NotFound,
    /// A fetcher failed. The entry is purged before this is observable, so
    /// the next lookup starts a fresh fetch.
    #[error("fetch failed: {0}")]
    Fetch(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Fetch(Arc::new(err))
    }
}

impl PartialEq for CacheError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CacheError::Cancelled, CacheError::Cancelled) => true,
            (CacheError::NotFound, CacheError::NotFound) => true,
            // broadcast clones share one allocation; otherwise compare the
            // rendered message, never the error's type name
            (CacheError::Fetch(a), CacheError::Fetch(b)) => {
                Arc::ptr_eq(a, b) || a.to_string() == b.to_string()
            }
            _ => false,
        }
    }
}

/// The outcome of a cache lookup.
pub type CacheResult<T> = Result<T, CacheError>;
