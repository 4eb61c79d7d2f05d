use std::fmt;

use thiserror::Error;

/// Opaque failure reported by a batch producer.
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// An error that happens while resolving a set of keys.
#[derive(Debug, Error)]
pub enum CacheError<K: fmt::Debug> {
    /// The batch producer failed for the given keys.
    ///
    /// The keys keep whatever cached state they had before the attempt, so a
    /// subsequent call is free to retry production.
    #[error("failed to produce {keys:?}")]
    Producer {
        /// The key batch the producer was invoked with.
        keys: Vec<K>,
        #[source]
        source: ProducerError,
    },

    /// A production requested a key its own execution context is already
    /// producing.
    ///
    /// Waiting would never finish, so this is reported instead of hanging.
    /// Unlike a producer failure, retrying cannot help.
    #[error("deadlock detected while producing {0:?}")]
    Deadlock(K),
}
