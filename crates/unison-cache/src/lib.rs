//! # Request-coalescing cache
//!
//! An in-memory cache that sits in front of expensive, cancellable async
//! work: network calls, database lookups, derived computations. Its job is
//! threefold:
//!
//! - **Coalescing**: for any key there is at most one underlying fetch in
//!   flight, no matter how many callers ask concurrently; all of them share
//!   the settlement.
//! - **Shared cancellation**: every caller attaches its own
//!   [`CancellationToken`](tokio_util::sync::CancellationToken). The fetch
//!   is only cancelled once *every* attached caller has cancelled; one
//!   caller giving up never tears down work others still want.
//! - **Multi-source fallback**: lookups walk an ordered chain of fetchers.
//!   A fetcher that does not know the key declines it and the next one is
//!   consulted; the first produced value wins.
//!
//! Settled values are memoized under a configurable policy: an optional
//! time-to-live (optionally rolling, i.e. measured from the last read), and
//! an optional capacity bound evicting oldest-first. Failed fetches are
//! never memoized: the entry is purged before the failure is observable, so
//! the next lookup starts from scratch.
//!
//! ## Cancellation model
//!
//! Tokens flow in one direction: callers hand theirs to the cache, the
//! cache reduces them with [`CancelGroup`] (all-of) and hands the derived
//! token to the fetchers. A caller that cancels while others are attached
//! gets [`CacheError::Cancelled`] for itself, the fetch keeps running, and
//! a completion always beats a cancellation that arrives after it.
//! [`any_of`] is the dual reduction for fetchers that need to combine the
//! derived token with cancellation signals of their own.
//!
//! ## Errors
//!
//! The error surface is the tagged [`CacheError`]: `Cancelled`, `NotFound`
//! (every fetcher declined), and `Fetch` carrying the fetcher's error.
//! Retries are deliberately not the cache's business; see [`RetryExecutor`]
//! for the contract fetchers can layer underneath.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tokio_util::sync::CancellationToken;
//! use unison_cache::{CacheResult, RequestCache};
//!
//! async fn run() -> CacheResult<()> {
//!     let cache: RequestCache<String, Arc<String>> = RequestCache::builder()
//!         .expiration(Duration::from_secs(300))
//!         .max_entries(10_000)
//!         .fetch_one(|key: &String, _token: CancellationToken| {
//!             let key = key.clone();
//!             async move { Ok(Some(Arc::new(format!("value for {key}")))) }
//!         })
//!         .build();
//!
//!     let token = CancellationToken::new();
//!     let value = cache.get("hello".into(), &token).await?;
//!     assert_eq!(value.as_str(), "value for hello");
//!     Ok(())
//! }
//! ```
//!
//! `get` and `get_many` spawn the fetch and the cancellation watchers onto
//! the ambient Tokio runtime, eagerly, so they must be called from within
//! one.

mod cache;
mod cancel;
mod config;
mod error;
mod fetcher;
mod flight;
mod retry;
mod store;
mod utils;

pub use cache::{CacheBuilder, RequestCache, ValueFuture};
pub use cancel::{any_of, CancelGroup, MemberId};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use fetcher::{BatchFn, FetchMany, FetchOne};
pub use retry::{NoRetry, RetryExecutor};
pub use store::CacheKey;
