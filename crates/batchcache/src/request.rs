use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::Hash;
use std::time::SystemTime;

use futures::future::BoxFuture;

use crate::error::ProducerError;

/// A batch of produced values, or the producer's failure.
pub type ProducedBatch<K, V> = Result<BTreeMap<K, V>, ProducerError>;

/// The producing side of a [`Cacher`](crate::Cacher).
///
/// Implementors supply the batch producer plus optional staleness and
/// capacity-accounting hooks.
pub trait BatchRequest: Send + Sync + 'static {
    type Key: Clone + fmt::Debug + Ord + Hash + Send + Sync + 'static;
    type Value: Send + Sync + 'static;

    /// Produces values for the given keys in one call.
    ///
    /// This is invoked with exactly the set of keys the calling context won
    /// the production tokens for, and for any individual key it is never
    /// running more than once at a time across all callers. It is free to
    /// call back into the same cache for *other* keys; requesting a key the
    /// current context is already producing fails with
    /// [`CacheError::Deadlock`](crate::CacheError::Deadlock).
    ///
    /// Keys absent from the returned map are recorded as produced with no
    /// value. Entries for keys beyond `keys` are cached opportunistically.
    fn produce_many<'a>(
        &'a self,
        keys: &'a BTreeSet<Self::Key>,
    ) -> BoxFuture<'a, ProducedBatch<Self::Key, Self::Value>>;

    /// Whether a previously produced value is too old to serve.
    ///
    /// Evaluated only for keys that currently have an entry; an expired
    /// entry is treated exactly like a missing one. The default never
    /// expires anything.
    fn is_expired(&self, _key: &Self::Key, _produced_at: SystemTime) -> bool {
        false
    }

    /// The "cost" of keeping this value in the store.
    fn weight(value: &Self::Value) -> u32 {
        std::mem::size_of_val(value) as u32
    }
}
