use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use moka::notification::RemovalCause;
use moka::sync::Cache;

/// A produced value as held by the store.
pub(crate) struct StoredEntry<V> {
    /// The value, or `None` when the producer returned nothing for the key.
    pub value: Option<Arc<V>>,
    /// Distinguishes this entry from later entries stored under the same key.
    generation: u64,
}

impl<V> Clone for StoredEntry<V> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        StoredEntry {
            value: self.value.clone(),
            generation: self.generation,
        }
    }
}

/// Bounded store of produced entries plus their production dates.
///
/// Values live in a weigher-bounded cache that evicts under capacity
/// pressure on its own; the store only reacts to the eviction notifications
/// its listener queues up. [`sweep`](EntryStore::sweep) drains that queue
/// and keeps the date table consistent with the entries. Everything else is
/// plain keyed access.
pub(crate) struct EntryStore<K, V> {
    name: String,
    entries: Cache<K, StoredEntry<V>>,
    produce_dates: Mutex<HashMap<K, SystemTime>>,
    reclaimed: Arc<Mutex<Vec<(K, u64)>>>,
    generation: AtomicU64,
}

impl<K, V> EntryStore<K, V>
where
    K: Clone + fmt::Debug + Ord + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        name: String,
        capacity: u64,
        weight: impl Fn(&V) -> u32 + Send + Sync + 'static,
    ) -> Self {
        let reclaimed = Arc::new(Mutex::new(Vec::new()));

        let queue = Arc::clone(&reclaimed);
        let listener = move |key: Arc<K>, entry: StoredEntry<V>, cause: RemovalCause| {
            // Only capacity pressure counts as reclamation; explicit removal
            // and overwrites keep their bookkeeping in sync elsewhere.
            if matches!(cause, RemovalCause::Size) {
                queue.lock().unwrap().push(((*key).clone(), entry.generation));
            }
        };

        let entries = Cache::builder()
            .name(&name)
            .max_capacity(capacity)
            // NOTE: the bookkeeping structures count towards the weight too.
            .weigher(move |_key: &K, entry: &StoredEntry<V>| {
                let value_weight = entry.value.as_deref().map_or(0, &weight);
                (std::mem::size_of::<(K, SystemTime, u64)>() as u32).saturating_add(value_weight)
            })
            .eviction_listener(listener)
            .build();

        EntryStore {
            name,
            entries,
            produce_dates: Mutex::new(HashMap::new()),
            reclaimed,
            generation: AtomicU64::new(0),
        }
    }

    /// Stores a produced value and its production date.
    pub(crate) fn insert(&self, key: K, value: Option<Arc<V>>, produced_at: SystemTime) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key.clone(), StoredEntry { value, generation });
        self.produce_dates.lock().unwrap().insert(key, produced_at);
    }

    pub(crate) fn get(&self, key: &K) -> Option<StoredEntry<V>> {
        self.entries.get(key)
    }

    pub(crate) fn produce_date(&self, key: &K) -> Option<SystemTime> {
        self.produce_dates.lock().unwrap().get(key).copied()
    }

    pub(crate) fn remove(&self, key: &K) {
        self.entries.invalidate(key);
        self.produce_dates.lock().unwrap().remove(key);
    }

    pub(crate) fn clear(&self) {
        self.entries.invalidate_all();
        self.produce_dates.lock().unwrap().clear();
    }

    /// Drains pending eviction notifications.
    ///
    /// The production date of a reclaimed entry is dropped unless a newer
    /// entry has landed for the same key since the eviction was queued; that
    /// newer entry's date must survive. Never blocks on in-flight work.
    pub(crate) fn sweep(&self) {
        self.entries.run_pending_tasks();

        let reclaimed = std::mem::take(&mut *self.reclaimed.lock().unwrap());
        if reclaimed.is_empty() {
            return;
        }

        let mut dates = self.produce_dates.lock().unwrap();
        for (key, generation) in reclaimed {
            if let Some(live) = self.entries.get(&key) {
                if live.generation != generation {
                    continue;
                }
            }
            dates.remove(&key);
            tracing::debug!(
                cache = %self.name,
                key = ?key,
                entries = self.entries.entry_count(),
                "dropped reclaimed entry"
            );
        }
    }

    /// Point-in-time snapshot of the live entries, ordered by key.
    ///
    /// Concurrent writers may or may not be visible; an entry can be
    /// reclaimed right after the snapshot was taken.
    pub(crate) fn live_entries(&self) -> Vec<(K, Option<Arc<V>>)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(key, entry)| ((*key).clone(), entry.value))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}
