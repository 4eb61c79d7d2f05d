use std::time::Duration;

use serde::Deserialize;

/// Static configuration for a single cache.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name used to tag log events emitted by this cache.
    pub name: String,

    /// Maximum total weight of live entries before the store evicts under
    /// pressure.
    ///
    /// The weight of an entry is its bookkeeping overhead plus
    /// [`BatchRequest::weight`](crate::BatchRequest::weight) of its value.
    pub in_memory_capacity: u64,

    /// Age after which a produced value is re-produced on access, evaluated
    /// in addition to
    /// [`BatchRequest::is_expired`](crate::BatchRequest::is_expired).
    ///
    /// `None` keeps values until they are evicted or invalidated.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: "default".into(),
            // NOTE: entries are weighed in bytes by default, which makes this
            // an approximate upper bound on cached value memory. Items that
            // share most of their data behind an `Arc` weigh less in reality.
            in_memory_capacity: 100 * 1024 * 1024,
            max_age: None,
        }
    }
}
