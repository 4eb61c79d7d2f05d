use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::watch;

use crate::config::CacheConfig;
use crate::context::{self, ContextId};
use crate::error::CacheError;
use crate::request::BatchRequest;
use crate::store::EntryStore;
use crate::utils::defer;

/// Exclusive right to produce one key.
///
/// At most one token exists per key at any instant; its presence is the sole
/// authority for "this key is currently being produced". Tokens never outlive
/// a single producer invocation.
struct ProductionToken {
    owner: ContextId,
    done: watch::Sender<()>,
}

/// Outcome of trying to claim a key's production.
enum Acquire {
    /// The calling context now owns the key's production.
    Acquired,
    /// Another context is producing the key; this signals its completion.
    Wait(watch::Receiver<()>),
    /// The calling context is already producing the key itself.
    OwnedBySelf,
}

/// Read-through cache that produces missing values in batches.
///
/// Lookups are deduplicated per key across concurrent callers: the first
/// context to request a missing key produces it, later arrivals wait for the
/// result. Batching hands the producer every missing key of a call at once,
/// which amortizes bulk-lookup backends instead of invoking them once per
/// key.
///
/// Cheap to clone; clones share all state.
pub struct Cacher<R: BatchRequest> {
    request: Arc<R>,
    config: CacheConfig,
    store: Arc<EntryStore<R::Key, R::Value>>,
    tokens: Arc<Mutex<HashMap<R::Key, ProductionToken>>>,
}

impl<R: BatchRequest> Clone for Cacher<R> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Cacher {
            request: Arc::clone(&self.request),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            tokens: Arc::clone(&self.tokens),
        }
    }
}

impl<R: BatchRequest> fmt::Debug for Cacher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self.tokens.try_lock().map(|t| t.len()).unwrap_or_default();
        f.debug_struct("Cacher")
            .field("config", &self.config)
            .field("live entries", &self.store.entry_count())
            .field("in-flight productions", &in_flight)
            .finish()
    }
}

impl<R: BatchRequest> Cacher<R> {
    /// Creates a cache that produces missing values through `request`.
    pub fn new(request: R, config: CacheConfig) -> Self {
        let store = EntryStore::new(config.name.clone(), config.in_memory_capacity, R::weight);
        Cacher {
            request: Arc::new(request),
            config,
            store: Arc::new(store),
            tokens: Default::default(),
        }
    }

    /// Returns values for all the given keys, producing the missing ones.
    ///
    /// Keys that do not convert into the cache's key space are dropped from
    /// the request instead of failing it. The returned map has one entry per
    /// accepted key; `None` marks keys the producer returned no value for.
    pub async fn get_many<I>(
        &self,
        keys: I,
    ) -> Result<BTreeMap<R::Key, Option<Arc<R::Value>>>, CacheError<R::Key>>
    where
        I: IntoIterator,
        I::Item: TryInto<R::Key>,
    {
        let keys: BTreeSet<R::Key> = keys
            .into_iter()
            .filter_map(|key| key.try_into().ok())
            .collect();

        match context::current() {
            // Nested call from inside a producer: stay in the caller's
            // context so re-entrant production is detectable.
            Some(ctx) => self.resolve(ctx, keys).await,
            None => {
                let ctx = ContextId::next();
                context::scope(ctx, self.resolve(ctx, keys)).await
            }
        }
    }

    /// Returns the value for the given key, producing it if necessary.
    pub async fn get(&self, key: R::Key) -> Result<Option<Arc<R::Value>>, CacheError<R::Key>> {
        let mut values = self.get_many([key.clone()]).await?;
        Ok(values.remove(&key).flatten())
    }

    /// Resolves `pending` to completion within one execution context.
    ///
    /// Repeats until every key is accounted for: a key whose production we
    /// waited on may not have landed (the producer can fail, or its entry
    /// can be reclaimed before we get to read it) and is then attempted
    /// again on the next pass.
    async fn resolve(
        &self,
        ctx: ContextId,
        mut pending: BTreeSet<R::Key>,
    ) -> Result<BTreeMap<R::Key, Option<Arc<R::Value>>>, CacheError<R::Key>> {
        self.store.sweep();

        let mut resolved = BTreeMap::new();

        while !pending.is_empty() {
            let mut batch = BTreeSet::new();
            let mut waiters = Vec::new();

            for key in std::mem::take(&mut pending) {
                // Already cached and still fresh?
                if let Some(produced_at) = self.store.produce_date(&key) {
                    if !self.is_expired(&key, produced_at) {
                        if let Some(entry) = self.store.get(&key) {
                            resolved.insert(key, entry.value);
                            continue;
                        }
                    }
                }

                match self.try_acquire(ctx, &key) {
                    Acquire::Acquired => {
                        batch.insert(key);
                    }
                    Acquire::Wait(done) => {
                        waiters.push((key.clone(), done));
                        pending.insert(key);
                    }
                    Acquire::OwnedBySelf => {
                        // Waiting on our own production can never finish.
                        // Give back what this pass claimed so far, nobody is
                        // going to produce it anymore.
                        self.release(&batch);
                        return Err(CacheError::Deadlock(key));
                    }
                }
            }

            if !batch.is_empty() {
                self.produce(&batch, &mut resolved).await?;
            }

            for (key, mut done) in waiters {
                tracing::debug!(cache = %self.config.name, key = ?key, "waiting on in-flight production");
                // An error means the producing side went away without
                // signalling; either way the token is gone and the next pass
                // re-checks the key.
                let _ = done.changed().await;
            }
        }

        Ok(resolved)
    }

    /// Invokes the producer for a batch of keys this context owns.
    async fn produce(
        &self,
        batch: &BTreeSet<R::Key>,
        resolved: &mut BTreeMap<R::Key, Option<Arc<R::Value>>>,
    ) -> Result<(), CacheError<R::Key>> {
        tracing::debug!(cache = %self.config.name, keys = ?batch, "producing batch");

        // Tokens are given back no matter how the production ends: success,
        // failure, or the caller dropping this future mid-await.
        let _release = defer(|| self.release(batch));

        match self.request.produce_many(batch).await {
            Ok(mut values) => {
                let now = SystemTime::now();
                for key in batch {
                    let value = values.remove(key).map(Arc::new);
                    tracing::debug!(cache = %self.config.name, key = ?key, "storing produced value");
                    self.store.insert(key.clone(), value.clone(), now);
                    resolved.insert(key.clone(), value);
                }
                // Producers may return more than was asked for; keep the
                // extras without reporting them to this caller.
                for (key, value) in values {
                    self.store.insert(key, Some(Arc::new(value)), now);
                }
                Ok(())
            }
            Err(source) => Err(match source.downcast::<CacheError<R::Key>>() {
                // A nested resolution already classified this failure;
                // deadlocks in particular must not come out looking
                // retryable.
                Ok(inner) => *inner,
                Err(source) => CacheError::Producer {
                    keys: batch.iter().cloned().collect(),
                    source,
                },
            }),
        }
    }

    /// Claims the production of `key` for `ctx`.
    ///
    /// Insert-if-absent under the table lock; this is what guarantees that
    /// the producer is never invoked for the same key by two contexts at
    /// the same time.
    fn try_acquire(&self, ctx: ContextId, key: &R::Key) -> Acquire {
        let mut tokens = self.tokens.lock().unwrap();
        match tokens.entry(key.clone()) {
            Entry::Vacant(slot) => {
                let (done, _) = watch::channel(());
                slot.insert(ProductionToken { owner: ctx, done });
                Acquire::Acquired
            }
            Entry::Occupied(slot) => {
                let token = slot.get();
                if token.owner == ctx {
                    Acquire::OwnedBySelf
                } else {
                    Acquire::Wait(token.done.subscribe())
                }
            }
        }
    }

    /// Removes the tokens for `batch` and wakes everyone blocked on them.
    fn release(&self, batch: &BTreeSet<R::Key>) {
        let mut tokens = self.tokens.lock().unwrap();
        for key in batch {
            if let Some(token) = tokens.remove(key) {
                let _ = token.done.send(());
            }
        }
    }

    fn is_expired(&self, key: &R::Key, produced_at: SystemTime) -> bool {
        if let Some(max_age) = self.config.max_age {
            // A production date in the future reads as age zero.
            let age = produced_at.elapsed().unwrap_or_default();
            if age >= max_age {
                return true;
            }
        }
        self.request.is_expired(key, produced_at)
    }

    /// Returns the last time a value for `key` was produced.
    pub fn last_produce_date(&self, key: &R::Key) -> Option<SystemTime> {
        self.store.sweep();
        self.store.produce_date(key)
    }

    /// Returns `true` if `key` has been produced.
    pub fn is_produced(&self, key: &R::Key) -> bool {
        self.last_produce_date(key).is_some()
    }

    /// Drops the cached value and production date of `key`.
    ///
    /// A production currently in flight for the key is not cancelled; it
    /// completes and stores its own result afterwards, which can be
    /// invalidated again if strict exclusion is required.
    pub fn invalidate(&self, key: &R::Key) {
        tracing::debug!(cache = %self.config.name, key = ?key, "invalidating");
        self.store.sweep();
        self.store.remove(key);
    }

    /// Drops every cached value and production date.
    pub fn invalidate_all(&self) {
        tracing::debug!(cache = %self.config.name, "invalidating all cached values");
        self.store.sweep();
        self.store.clear();
    }

    /// Best-effort snapshot of all live entries, ordered by key.
    pub fn live_entries(&self) -> Vec<(R::Key, Option<Arc<R::Value>>)> {
        self.store.sweep();
        self.store.live_entries()
    }

    /// Returns `true` if `candidate` converts into this cache's key space.
    ///
    /// This is purely about the key space; it says nothing about whether a
    /// value is currently cached. Keys failing the conversion are the ones
    /// [`get_many`](Self::get_many) silently drops.
    pub fn accepts_key<Q>(&self, candidate: Q) -> bool
    where
        Q: TryInto<R::Key>,
    {
        candidate.try_into().is_ok()
    }
}
