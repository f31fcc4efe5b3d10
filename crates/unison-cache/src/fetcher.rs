use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};

/// A single-key producer.
///
/// `Ok(None)` means the source does not know the key; the chain moves on to
/// the next producer. The token is the all-of reduction over every caller
/// currently attached to the fetch; implementations should wind down in
/// bounded time once it fires.
///
/// Implemented for closures of the matching shape; clone what the returned
/// future needs before constructing it.
pub trait FetchOne<K, V>: Send + Sync + 'static {
    fn fetch_one(
        &self,
        key: &K,
        token: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<Option<V>>>;
}

impl<K, V, F, Fut> FetchOne<K, V> for F
where
    F: Fn(&K, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<V>>> + Send + 'static,
{
    fn fetch_one(
        &self,
        key: &K,
        token: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<Option<V>>> {
        (self)(key, token).boxed()
    }
}

/// A batched producer.
///
/// The result must align with `keys`; `None` slots fall through to the next
/// producer in the chain. See [`BatchFn`] for the usual way to build one
/// out of a backend call and a per-key selector.
pub trait FetchMany<K, V>: Send + Sync + 'static {
    fn fetch_many(
        &self,
        keys: &[K],
        token: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<Vec<Option<V>>>>;
}

/// Adapts one batched backend call plus a per-key selector into a
/// [`FetchMany`].
///
/// The backend is invoked once with every key still unresolved at this
/// point of the chain; the selector then picks each key's value out of the
/// full response. The selector must be pure: same response and key, same
/// answer.
pub struct BatchFn<F, S> {
    fetch: F,
    select: Arc<S>,
}

impl<F, S> BatchFn<F, S> {
    pub fn new(fetch: F, select: S) -> Self {
        BatchFn {
            fetch,
            select: Arc::new(select),
        }
    }
}

impl<K, V, R, F, Fut, S> FetchMany<K, V> for BatchFn<F, S>
where
    K: Clone + Send + Sync + 'static,
    V: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<K>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    S: Fn(&R, &K) -> Option<V> + Send + Sync + 'static,
{
    fn fetch_many(
        &self,
        keys: &[K],
        token: CancellationToken,
    ) -> BoxFuture<'static, anyhow::Result<Vec<Option<V>>>> {
        let response = (self.fetch)(keys.to_vec(), token);
        let select = Arc::clone(&self.select);
        let keys = keys.to_vec();
        async move {
            let response = response.await?;
            Ok(keys.iter().map(|key| select(&response, key)).collect())
        }
        .boxed()
    }
}

/// One producer in a chain.
pub(crate) enum Fetcher<K, V> {
    One(Arc<dyn FetchOne<K, V>>),
    Many(Arc<dyn FetchMany<K, V>>),
}

impl<K, V> Clone for Fetcher<K, V> {
    fn clone(&self) -> Self {
        match self {
            Fetcher::One(fetch) => Fetcher::One(Arc::clone(fetch)),
            Fetcher::Many(fetch) => Fetcher::Many(Arc::clone(fetch)),
        }
    }
}

/// Ordered, non-empty list of producers.
///
/// Earlier producers win; a producer that declines a key passes it on to
/// the next one. Keys the whole chain declines read as
/// [`CacheError::NotFound`].
pub(crate) struct FetcherChain<K, V> {
    fetchers: Vec<Fetcher<K, V>>,
}

impl<K, V> FetcherChain<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(fetchers: Vec<Fetcher<K, V>>) -> Self {
        assert!(!fetchers.is_empty(), "a cache needs at least one fetcher");
        FetcherChain { fetchers }
    }

    /// True if the chain starts with a batched producer.
    pub(crate) fn batched_head(&self) -> bool {
        matches!(self.fetchers.first(), Some(Fetcher::Many(_)))
    }

    /// Resolves one key through the chain, in order.
    pub(crate) async fn resolve_one(&self, key: &K, token: &CancellationToken) -> CacheResult<V> {
        for fetcher in &self.fetchers {
            let produced = match fetcher {
                Fetcher::One(fetch) => fetch.fetch_one(key, token.clone()).await?,
                Fetcher::Many(fetch) => fetch
                    .fetch_many(std::slice::from_ref(key), token.clone())
                    .await?
                    .pop()
                    .flatten(),
            };
            if let Some(value) = produced {
                return Ok(value);
            }
        }
        Err(CacheError::NotFound)
    }

    /// Resolves a set of keys through the chain.
    ///
    /// Each producer sees only the keys its predecessors declined: one call
    /// for a batched producer, concurrent per-key calls for a single-key
    /// one. A failing batch call fails every key it was asked for with the
    /// same shared error; a failing per-key call fails only its own key.
    /// The result aligns with `keys`.
    pub(crate) async fn resolve_many(
        &self,
        keys: &[K],
        token: &CancellationToken,
    ) -> Vec<CacheResult<V>> {
        let mut outcomes: Vec<Option<CacheResult<V>>> = keys.iter().map(|_| None).collect();
        let mut pending: Vec<usize> = (0..keys.len()).collect();

        for fetcher in &self.fetchers {
            if pending.is_empty() {
                break;
            }
            match fetcher {
                Fetcher::Many(fetch) => {
                    let subset: Vec<K> = pending.iter().map(|&i| keys[i].clone()).collect();
                    match fetch.fetch_many(&subset, token.clone()).await {
                        Ok(produced) => {
                            debug_assert_eq!(produced.len(), subset.len());
                            let mut still_pending = Vec::new();
                            for (&i, value) in pending.iter().zip(produced) {
                                match value {
                                    Some(value) => outcomes[i] = Some(Ok(value)),
                                    None => still_pending.push(i),
                                }
                            }
                            pending = still_pending;
                        }
                        Err(err) => {
                            let err = Arc::new(err);
                            for &i in &pending {
                                outcomes[i] = Some(Err(CacheError::Fetch(Arc::clone(&err))));
                            }
                            pending.clear();
                        }
                    }
                }
                Fetcher::One(fetch) => {
                    let calls = pending
                        .iter()
                        .map(|&i| fetch.fetch_one(&keys[i], token.clone()));
                    let produced = join_all(calls).await;
                    let mut still_pending = Vec::new();
                    for (&i, result) in pending.iter().zip(produced) {
                        match result {
                            Ok(Some(value)) => outcomes[i] = Some(Ok(value)),
                            Ok(None) => still_pending.push(i),
                            Err(err) => outcomes[i] = Some(Err(err.into())),
                        }
                    }
                    pending = still_pending;
                }
            }
        }

        outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap_or(Err(CacheError::NotFound)))
            .collect()
    }
}
