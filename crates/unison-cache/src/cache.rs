use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelGroup;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::fetcher::{FetchMany, FetchOne, Fetcher, FetcherChain};
use crate::flight::{await_outcome, flight_channel, Flight, SettleChannel};
use crate::store::{CacheKey, Entry, EntryState, EntryStore};
use crate::utils::finally;

/// Future resolving to one cached value.
pub type ValueFuture<V> = BoxFuture<'static, CacheResult<V>>;

type KeyFn<K, I> = Box<dyn Fn(&K) -> I + Send + Sync>;

struct CacheInner<K, V, I> {
    store: Mutex<EntryStore<I, V>>,
    chain: FetcherChain<K, V>,
    key_fn: KeyFn<K, I>,
    /// When false, fetched settlements are dropped from the store right
    /// away and only the in-flight coalescing window remains.
    retain: bool,
    flight_ids: AtomicU64,
}

/// Request-coalescing, multi-source, in-memory async cache.
///
/// For any key there is at most one underlying fetch in flight, no matter
/// how many callers ask for it concurrently; every caller shares that
/// fetch's settlement. Each caller brings its own [`CancellationToken`],
/// and the fetch itself is cancelled only once every attached caller has
/// cancelled. Settled values are memoized subject to the configured expiry
/// and capacity policy; failed fetches are forgotten so the next lookup
/// starts over.
///
/// Lookups consult the configured fetchers in order until one produces a
/// value. Cloning the cache is cheap and clones share all state.
///
/// `get` and `get_many` must be called from within a Tokio runtime; fetches
/// and cancellation watchers are spawned onto it.
pub struct RequestCache<K, V, I = K> {
    inner: Arc<CacheInner<K, V, I>>,
}

impl<K, V, I> Clone for RequestCache<K, V, I> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        RequestCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, I: CacheKey> fmt::Debug for RequestCache<K, V, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .store
            .try_lock()
            .map(|mut store| store.len())
            .unwrap_or_default();
        f.debug_struct("RequestCache")
            .field("entries", &entries)
            .finish()
    }
}

impl<K: CacheKey, V> RequestCache<K, V, K> {
    pub fn builder() -> CacheBuilder<K, V, K> {
        CacheBuilder::new()
    }
}

impl<K, V, I> RequestCache<K, V, I>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    I: CacheKey,
{
    /// Looks the key up, joining any in-flight fetch, or starts a new one.
    ///
    /// A caller whose token has already fired gets `Cancelled` back without
    /// touching any state, and the fetchers are not consulted.
    ///
    /// NOTE: This function is *not* `async` on purpose: the lookup and the
    /// fetch spawn happen eagerly, so callers arriving in the same tick
    /// coalesce onto a single fetch even before anyone polls the returned
    /// future.
    pub fn get(&self, key: K, token: &CancellationToken) -> ValueFuture<V> {
        if token.is_cancelled() {
            return future::ready(Err(CacheError::Cancelled)).boxed();
        }

        let internal = (self.inner.key_fn)(&key);
        let mut store = self.inner.store.lock();

        if let Some(entry) = store.get(&internal) {
            match &entry.state {
                EntryState::Settled(value) => {
                    tracing::trace!(key = ?internal, "cache hit");
                    return future::ready(Ok(value.clone())).boxed();
                }
                EntryState::Pending(flight) => {
                    if flight.group.add(token).is_none() {
                        return future::ready(Err(CacheError::Cancelled)).boxed();
                    }
                    tracing::trace!(key = ?internal, "joining in-flight fetch");
                    return await_outcome(flight.channel.clone(), token.clone()).boxed();
                }
            }
        }

        let channel = self.spawn_flight(key, internal, token, &mut store);
        await_outcome(channel, token.clone()).boxed()
    }

    /// Looks up many keys at once, returning one future per input key, in
    /// input order.
    ///
    /// Present keys join their entries exactly like [`get`](Self::get).
    /// Absent keys are fetched per key when the chain starts with a
    /// single-key fetcher, or through one shared batched fetch when it
    /// starts with a batched one; in the batched case all new entries share
    /// a single cancellation group seeded with this caller's token.
    /// Duplicate input keys coalesce onto the entry their first occurrence
    /// creates.
    pub fn get_many(&self, keys: Vec<K>, token: &CancellationToken) -> Vec<(K, ValueFuture<V>)> {
        if token.is_cancelled() {
            return keys
                .into_iter()
                .map(|key| {
                    let ready: ValueFuture<V> = future::ready(Err(CacheError::Cancelled)).boxed();
                    (key, ready)
                })
                .collect();
        }

        let batched = self.inner.chain.batched_head();
        let mut store = self.inner.store.lock();
        let mut results: Vec<(K, ValueFuture<V>)> = Vec::with_capacity(keys.len());
        // keys waiting on the shared batch driver
        let mut batch: Vec<(K, I, oneshot::Sender<CacheResult<V>>)> = Vec::new();
        let mut shared: Option<(Arc<CancelGroup>, u64)> = None;

        for key in keys {
            let internal = (self.inner.key_fn)(&key);

            if let Some(entry) = store.get(&internal) {
                match &entry.state {
                    EntryState::Settled(value) => {
                        let value = value.clone();
                        results.push((key, future::ready(Ok(value)).boxed()));
                    }
                    EntryState::Pending(flight) => {
                        if flight.group.add(token).is_none() {
                            results.push((key, future::ready(Err(CacheError::Cancelled)).boxed()));
                        } else {
                            results.push((
                                key,
                                await_outcome(flight.channel.clone(), token.clone()).boxed(),
                            ));
                        }
                    }
                }
                continue;
            }

            if batched {
                let (group, id) = shared.get_or_insert_with(|| {
                    let group = Arc::new(CancelGroup::new());
                    let _ = group.add(token);
                    let id = self.inner.flight_ids.fetch_add(1, Ordering::Relaxed);
                    (group, id)
                });
                let (sender, channel) = flight_channel();
                store.insert(
                    internal.clone(),
                    Entry::pending(Flight {
                        channel: channel.clone(),
                        group: Arc::clone(group),
                        id: *id,
                    }),
                );
                batch.push((key.clone(), internal, sender));
                results.push((key, await_outcome(channel, token.clone()).boxed()));
            } else {
                let channel = self.spawn_flight(key.clone(), internal, token, &mut store);
                results.push((key, await_outcome(channel, token.clone()).boxed()));
            }
        }

        drop(store);

        if let Some((group, id)) = shared {
            self.spawn_batch(batch, group, id);
        }

        results
    }

    /// Installs a settled value, replacing any existing entry for the key.
    ///
    /// An in-flight fetch for the key keeps settling the futures it already
    /// handed out, but its result no longer touches the store.
    pub fn set(&self, key: K, value: V) {
        let internal = (self.inner.key_fn)(&key);
        tracing::trace!(key = ?internal, "installing value");
        self.inner
            .store
            .lock()
            .insert(internal, Entry::settled(value));
    }

    /// Removes the entry unconditionally.
    ///
    /// An in-flight fetch keeps settling the futures it already handed out;
    /// the next `get` starts fresh.
    pub fn delete(&self, key: &K) -> bool {
        let internal = (self.inner.key_fn)(key);
        self.inner.store.lock().remove(&internal).is_some()
    }

    /// True iff an unexpired entry (pending or settled) exists for the key.
    pub fn has(&self, key: &K) -> bool {
        let internal = (self.inner.key_fn)(key);
        self.inner.store.lock().contains(&internal)
    }

    /// Number of unexpired entries.
    pub fn len(&self) -> usize {
        self.inner.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. In-flight fetches settle the futures they already
    /// handed out.
    pub fn clear(&self) {
        self.inner.store.lock().clear();
    }

    /// Installs a pending entry for the key and spawns its fetch.
    ///
    /// Runs under the store lock and therefore never races a settlement for
    /// the same key.
    fn spawn_flight(
        &self,
        key: K,
        internal: I,
        token: &CancellationToken,
        store: &mut EntryStore<I, V>,
    ) -> SettleChannel<V> {
        let id = self.inner.flight_ids.fetch_add(1, Ordering::Relaxed);
        let group = Arc::new(CancelGroup::new());
        // A group with no members never fires; seed it before the fetch
        // starts so an all-cancel can actually reach it.
        let _ = group.add(token);
        let derived = group.derived();
        let (sender, channel) = flight_channel();

        tracing::trace!(key = ?internal, id, "starting fetch");
        store.insert(
            internal.clone(),
            Entry::pending(Flight {
                channel: channel.clone(),
                group: Arc::clone(&group),
                id,
            }),
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _cleanup = finally({
                let inner = Arc::clone(&inner);
                let internal = internal.clone();
                let group = Arc::clone(&group);
                move || {
                    inner.purge_flight(&internal, id);
                    group.shutdown();
                }
            });

            let outcome = tokio::select! {
                biased;
                outcome = inner.chain.resolve_one(&key, &derived) => outcome,
                _ = derived.cancelled() => Err(CacheError::Cancelled),
            };

            // the store must reflect the settlement before anyone can
            // observe it through the channel
            inner.settle(&internal, id, &outcome);
            sender.send(outcome).ok();
        });

        channel
    }

    /// Spawns one driver resolving a whole set of absent keys through the
    /// chain, fanning the per-key outcomes out to their entries.
    fn spawn_batch(
        &self,
        batch: Vec<(K, I, oneshot::Sender<CacheResult<V>>)>,
        group: Arc<CancelGroup>,
        id: u64,
    ) {
        let derived = group.derived();
        let inner = Arc::clone(&self.inner);
        tracing::trace!(keys = batch.len(), id, "starting batched fetch");

        tokio::spawn(async move {
            let _cleanup = finally({
                let inner = Arc::clone(&inner);
                let internals: Vec<I> = batch
                    .iter()
                    .map(|(_, internal, _)| internal.clone())
                    .collect();
                let group = Arc::clone(&group);
                move || {
                    for internal in &internals {
                        inner.purge_flight(internal, id);
                    }
                    group.shutdown();
                }
            });

            let keys: Vec<K> = batch.iter().map(|(key, _, _)| key.clone()).collect();
            let outcomes = tokio::select! {
                biased;
                outcomes = inner.chain.resolve_many(&keys, &derived) => outcomes,
                _ = derived.cancelled() => keys.iter().map(|_| Err(CacheError::Cancelled)).collect(),
            };

            for ((_, internal, sender), outcome) in batch.into_iter().zip(outcomes) {
                inner.settle(&internal, id, &outcome);
                sender.send(outcome).ok();
            }
        });
    }
}

impl<K, V, I> CacheInner<K, V, I>
where
    V: Clone,
    I: CacheKey,
{
    /// Applies a flight's outcome to the store, unless something newer
    /// (a `set`, a `delete`, an eviction, a fresh flight) replaced the
    /// entry; then the outcome only reaches the callers already attached.
    fn settle(&self, key: &I, id: u64, outcome: &CacheResult<V>) {
        let mut store = self.store.lock();
        if store.pending_flight(key) != Some(id) {
            tracing::trace!(?key, id, "discarding settlement of a replaced fetch");
            return;
        }
        match outcome {
            Ok(value) if self.retain => {
                tracing::trace!(?key, id, "fetch settled");
                if let Some(entry) = store.entry_mut(key) {
                    entry.state = EntryState::Settled(value.clone());
                }
            }
            Ok(_) => {
                tracing::trace!(?key, id, "fetch settled, entry not retained");
                store.remove(key);
            }
            Err(error) => {
                tracing::trace!(?key, id, %error, "fetch failed, entry purged");
                store.remove(key);
            }
        }
    }

    /// Unwind-path cleanup: drops the entry if this flight still owns it,
    /// so a dead fetch cannot wedge its key.
    fn purge_flight(&self, key: &I, id: u64) {
        let mut store = self.store.lock();
        if store.pending_flight(key) == Some(id) {
            store.remove(key);
        }
    }
}

/// Builder for [`RequestCache`].
///
/// At least one fetcher is required; everything else is optional.
pub struct CacheBuilder<K, V, I = K> {
    config: CacheConfig,
    fetchers: Vec<Fetcher<K, V>>,
    key_fn: KeyFn<K, I>,
    retain: bool,
}

impl<K: CacheKey, V> CacheBuilder<K, V, K> {
    pub fn new() -> Self {
        CacheBuilder {
            config: CacheConfig::default(),
            fetchers: Vec::new(),
            key_fn: Box::new(|key: &K| key.clone()),
            retain: true,
        }
    }
}

impl<K: CacheKey, V> Default for CacheBuilder<K, V, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, I> CacheBuilder<K, V, I>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    I: CacheKey,
{
    /// Replaces the whole expiry and capacity policy at once.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Entries expire this long after insertion (or after the last read,
    /// with [`rolling_expiration`](Self::rolling_expiration)).
    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.config.expiration = Some(ttl);
        self
    }

    /// Measures expiration from the last successful read instead of from
    /// insertion; reads also move the entry to the back of the eviction
    /// order.
    pub fn rolling_expiration(mut self, rolling: bool) -> Self {
        self.config.rolling_expiration = rolling;
        self
    }

    /// Caps the store; the oldest entries are evicted first.
    pub fn max_entries(mut self, limit: usize) -> Self {
        self.config.max_entries = Some(limit);
        self
    }

    /// Maps caller keys to the identity used inside the store, e.g. to
    /// normalize or to project out the relevant part of a composite key.
    pub fn key_fn<J, F>(self, key_fn: F) -> CacheBuilder<K, V, J>
    where
        J: CacheKey,
        F: Fn(&K) -> J + Send + Sync + 'static,
    {
        CacheBuilder {
            config: self.config,
            fetchers: self.fetchers,
            key_fn: Box::new(key_fn),
            retain: self.retain,
        }
    }

    /// Appends a single-key fetcher to the chain.
    pub fn fetch_one(mut self, fetcher: impl FetchOne<K, V>) -> Self {
        self.fetchers.push(Fetcher::One(Arc::new(fetcher)));
        self
    }

    /// Appends a batched fetcher to the chain.
    pub fn fetch_many(mut self, fetcher: impl FetchMany<K, V>) -> Self {
        self.fetchers.push(Fetcher::Many(Arc::new(fetcher)));
        self
    }

    /// Keeps only the in-flight coalescing window: fetched entries are
    /// dropped as soon as their fetch settles. Values installed via
    /// [`RequestCache::set`] are retained normally.
    pub fn no_retention(mut self) -> Self {
        self.retain = false;
        self
    }

    /// Builds the cache.
    ///
    /// # Panics
    ///
    /// Panics if no fetcher was configured; a cache without fetchers is a
    /// startup misconfiguration.
    pub fn build(self) -> RequestCache<K, V, I> {
        RequestCache {
            inner: Arc::new(CacheInner {
                store: Mutex::new(EntryStore::new(&self.config)),
                chain: FetcherChain::new(self.fetchers),
                key_fn: self.key_fn,
                retain: self.retain,
                flight_ids: AtomicU64::new(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fetcher::BatchFn;
    use crate::test::{setup, Counter, Gate};

    /// Lets spawned drivers and cancellation watchers run.
    async fn tick() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn constant(calls: Counter, value: &str) -> impl FetchOne<String, String> {
        let value = value.to_owned();
        move |_key: &String, _token: CancellationToken| {
            calls.bump();
            let value = value.clone();
            async move { Ok(Some(value)) }
        }
    }

    fn gated(calls: Counter, gate: Gate, value: &str) -> impl FetchOne<String, String> {
        let value = value.to_owned();
        move |_key: &String, _token: CancellationToken| {
            calls.bump();
            let gate = gate.clone();
            let value = value.clone();
            async move {
                gate.wait().await;
                Ok(Some(value))
            }
        }
    }

    /// Never resolves on its own; exposes the token it was handed.
    fn hanging(
        calls: Counter,
        seen: Arc<Mutex<Option<CancellationToken>>>,
    ) -> impl FetchOne<String, String> {
        move |_key: &String, token: CancellationToken| {
            calls.bump();
            *seen.lock() = Some(token);
            async move { futures::future::pending().await }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_lookups_share_one_fetch() {
        setup();
        let calls = Counter::new();
        let gate = Gate::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(gated(calls.clone(), gate.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        let lookups: Vec<_> = (0..8).map(|_| cache.get("x".into(), &token)).collect();
        gate.open();
        for lookup in lookups {
            assert_eq!(lookup.await, Ok("v".to_string()));
        }
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancels_the_fetch_only_when_every_caller_has_cancelled() {
        setup();
        let calls = Counter::new();
        let seen: Arc<Mutex<Option<CancellationToken>>> = Default::default();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(hanging(calls.clone(), Arc::clone(&seen)))
            .build();

        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let first = cache.get("x".into(), &a);
        let second = cache.get("x".into(), &b);
        tick().await;
        assert_eq!(calls.get(), 1);
        let fetch_token = seen.lock().clone().unwrap();

        a.cancel();
        tick().await;
        assert!(!fetch_token.is_cancelled());

        b.cancel();
        tick().await;
        assert!(fetch_token.is_cancelled());

        assert_eq!(first.await, Err(CacheError::Cancelled));
        assert_eq!(second.await, Err(CacheError::Cancelled));
        // the dismantled flight leaves nothing behind
        assert!(!cache.has(&"x".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn one_cancelling_caller_does_not_disturb_the_rest() {
        setup();
        let calls = Counter::new();
        let gate = Gate::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(gated(calls.clone(), gate.clone(), "v"))
            .build();

        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let first = cache.get("x".into(), &a);
        let second = cache.get("x".into(), &b);

        a.cancel();
        assert_eq!(first.await, Err(CacheError::Cancelled));

        gate.open();
        assert_eq!(second.await, Ok("v".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn a_prefired_token_never_reaches_the_fetchers() {
        setup();
        let calls = Counter::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(constant(calls.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            cache.get("x".into(), &token).await,
            Err(CacheError::Cancelled)
        );
        assert_eq!(calls.get(), 0);
        assert!(!cache.has(&"x".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_beats_a_later_cancellation() {
        setup();
        let calls = Counter::new();
        let gate = Gate::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(gated(calls.clone(), gate.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        let inflight = cache.get("x".into(), &token);

        // let the fetch settle first, then cancel
        gate.open();
        tick().await;
        token.cancel();
        assert_eq!(inflight.await, Ok("v".to_string()));
    }

    #[tokio::test]
    async fn memoizes_a_settled_value() {
        setup();
        let calls = Counter::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(constant(calls.clone(), "v"))
            .build();

        let first = CancellationToken::new();
        assert_eq!(cache.get("x".into(), &first).await, Ok("v".to_string()));
        let second = CancellationToken::new();
        assert_eq!(cache.get("x".into(), &second).await, Ok("v".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn falls_back_through_the_chain_in_order() {
        setup();
        let order: Arc<Mutex<Vec<&'static str>>> = Default::default();
        let primary = {
            let order = Arc::clone(&order);
            move |_key: &String, _token: CancellationToken| {
                order.lock().push("primary");
                async move { Ok(None) }
            }
        };
        let fallback = {
            let order = Arc::clone(&order);
            move |_key: &String, _token: CancellationToken| {
                order.lock().push("fallback");
                async move { Ok(Some("v".to_string())) }
            }
        };
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(primary)
            .fetch_one(fallback)
            .build();

        let token = CancellationToken::new();
        assert_eq!(cache.get("x".into(), &token).await, Ok("v".to_string()));
        assert_eq!(*order.lock(), vec!["primary", "fallback"]);
    }

    #[tokio::test]
    async fn batches_only_the_missing_keys() {
        setup();
        let invocations: Arc<Mutex<Vec<Vec<String>>>> = Default::default();
        let fetch = {
            let invocations = Arc::clone(&invocations);
            move |keys: Vec<String>, _token: CancellationToken| {
                invocations.lock().push(keys.clone());
                async move {
                    Ok(keys
                        .into_iter()
                        .map(|key| (key.clone(), format!("fetched {key}")))
                        .collect::<Vec<_>>())
                }
            }
        };
        let select = |response: &Vec<(String, String)>, key: &String| {
            response
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_many(BatchFn::new(fetch, select))
            .build();

        cache.set("a".into(), "cached".into());

        let token = CancellationToken::new();
        let results = cache.get_many(vec!["a".into(), "b".into(), "c".into()], &token);
        let mut settled = Vec::new();
        for (key, lookup) in results {
            settled.push((key, lookup.await.unwrap()));
        }
        assert_eq!(
            settled,
            vec![
                ("a".to_string(), "cached".to_string()),
                ("b".to_string(), "fetched b".to_string()),
                ("c".to_string(), "fetched c".to_string()),
            ]
        );
        assert_eq!(
            *invocations.lock(),
            vec![vec!["b".to_string(), "c".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn get_many_with_a_single_key_head_fetches_per_key() {
        setup();
        let calls = Counter::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one({
                let calls = calls.clone();
                move |key: &String, _token: CancellationToken| {
                    calls.bump();
                    let value = format!("value {key}");
                    async move { Ok(Some(value)) }
                }
            })
            .build();

        cache.set("a".into(), "cached".into());

        let token = CancellationToken::new();
        let results = cache.get_many(vec!["a".into(), "b".into(), "c".into()], &token);
        let mut settled = Vec::new();
        for (key, lookup) in results {
            settled.push((key, lookup.await.unwrap()));
        }
        assert_eq!(
            settled,
            vec![
                ("a".to_string(), "cached".to_string()),
                ("b".to_string(), "value b".to_string()),
                ("c".to_string(), "value c".to_string()),
            ]
        );
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn duplicate_keys_share_one_fetch() {
        setup();
        let calls = Counter::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(constant(calls.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        let results = cache.get_many(vec!["x".into(), "x".into()], &token);
        assert_eq!(results.len(), 2);
        for (_, lookup) in results {
            assert_eq!(lookup.await, Ok("v".to_string()));
        }
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn failed_fetches_are_forgotten() {
        setup();
        let calls = Counter::new();
        let failing = {
            let calls = calls.clone();
            move |_key: &String, _token: CancellationToken| {
                calls.bump();
                async move { Err::<Option<String>, _>(anyhow::anyhow!("backend down")) }
            }
        };
        let cache: RequestCache<String, String> =
            RequestCache::builder().fetch_one(failing).build();

        let token = CancellationToken::new();
        let err = cache.get("x".into(), &token).await.unwrap_err();
        assert_eq!(err.to_string(), "fetch failed: backend down");
        assert!(!cache.has(&"x".into()));

        // purged, so the next lookup tries again
        let _ = cache.get("x".into(), &token).await;
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn set_during_a_fetch_wins_the_store() {
        setup();
        let calls = Counter::new();
        let gate = Gate::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(gated(calls.clone(), gate.clone(), "fetched"))
            .build();

        let token = CancellationToken::new();
        let inflight = cache.get("x".into(), &token);
        tick().await;
        cache.set("x".into(), "manual".into());

        gate.open();
        // callers already attached still observe the fetch outcome
        assert_eq!(inflight.await, Ok("fetched".to_string()));
        // but the store keeps the installed value
        assert_eq!(cache.get("x".into(), &token).await, Ok("manual".to_string()));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn the_last_set_wins() {
        setup();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(constant(Counter::new(), "v"))
            .build();

        cache.set("x".into(), "v1".into());
        cache.set("x".into(), "v2".into());
        let token = CancellationToken::new();
        assert_eq!(cache.get("x".into(), &token).await, Ok("v2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_fetched_again() {
        setup();
        let calls = Counter::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .expiration(Duration::from_millis(100))
            .fetch_one(constant(calls.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        assert_eq!(cache.get("x".into(), &token).await, Ok("v".to_string()));
        assert_eq!(calls.get(), 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(cache.has(&"x".into()));
        assert_eq!(cache.get("x".into(), &token).await, Ok("v".to_string()));
        assert_eq!(calls.get(), 1);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!cache.has(&"x".into()));
        assert_eq!(cache.get("x".into(), &token).await, Ok("v".to_string()));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_expiration_counts_from_the_last_read() {
        setup();
        let calls = Counter::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .expiration(Duration::from_millis(100))
            .rolling_expiration(true)
            .fetch_one(constant(calls.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        cache.get("x".into(), &token).await.unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(60)).await;
            assert_eq!(cache.get("x".into(), &token).await, Ok("v".to_string()));
        }
        assert_eq!(calls.get(), 1);

        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(!cache.has(&"x".into()));
    }

    #[tokio::test]
    async fn capacity_keeps_the_most_recent_insertions() {
        setup();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .max_entries(2)
            .fetch_one(constant(Counter::new(), "v"))
            .build();

        for key in ["k1", "k2", "k3", "k4"] {
            cache.set(key.into(), "v".into());
        }
        assert!(!cache.has(&"k1".into()));
        assert!(!cache.has(&"k2".into()));
        assert!(cache.has(&"k3".into()));
        assert!(cache.has(&"k4".into()));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_retention_keeps_only_the_inflight_window() {
        setup();
        let calls = Counter::new();
        let gate = Gate::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .no_retention()
            .fetch_one(gated(calls.clone(), gate.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        let first = cache.get("x".into(), &token);
        let second = cache.get("x".into(), &token);
        tick().await;
        assert_eq!(calls.get(), 1);
        assert!(cache.has(&"x".into()));

        gate.open();
        assert_eq!(first.await, Ok("v".to_string()));
        assert_eq!(second.await, Ok("v".to_string()));
        assert!(!cache.has(&"x".into()));

        // gone from the store, so the next lookup fetches again
        let _ = cache.get("x".into(), &token);
        tick().await;
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_does_not_disturb_attached_callers() {
        setup();
        let calls = Counter::new();
        let gate = Gate::new();
        let cache: RequestCache<String, String> = RequestCache::builder()
            .fetch_one(gated(calls.clone(), gate.clone(), "v"))
            .build();

        let token = CancellationToken::new();
        let inflight = cache.get("x".into(), &token);
        tick().await;
        assert!(cache.delete(&"x".into()));
        assert!(!cache.has(&"x".into()));

        gate.open();
        assert_eq!(inflight.await, Ok("v".to_string()));
        // the settlement of the deleted flight does not repopulate the store
        assert!(!cache.has(&"x".into()));
    }

    #[tokio::test]
    async fn the_key_transformer_defines_identity() {
        setup();
        let calls = Counter::new();
        let cache: RequestCache<String, String, String> = RequestCache::builder()
            .fetch_one(constant(calls.clone(), "v"))
            .key_fn(|key: &String| key.to_ascii_lowercase())
            .build();

        let token = CancellationToken::new();
        assert_eq!(cache.get("KEY".into(), &token).await, Ok("v".to_string()));
        assert_eq!(cache.get("key".into(), &token).await, Ok("v".to_string()));
        assert_eq!(calls.get(), 1);
        assert!(cache.has(&"KeY".into()));
    }
}
