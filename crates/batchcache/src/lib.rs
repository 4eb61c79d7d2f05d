//! # Pull-through batch caching
//!
//! This crate provides [`Cacher`], a read-through cache that produces values
//! for whole sets of keys at once, on demand. It is built for subsystems that
//! compute expensive derived values keyed by arbitrary identifiers, where many
//! callers request overlapping key sets concurrently and where producing a
//! value is costly enough that doing it twice is worth avoiding.
//!
//! ## Layers
//!
//! A [`Cacher`] is a thin coordination layer over three pieces of state:
//!
//! - A bounded in-memory store of produced entries. Entries are weighed via
//!   [`BatchRequest::weight`] and evicted under capacity pressure without the
//!   cache's involvement; the cache only reacts to eviction notifications,
//!   which are drained at the start of every access and keep the production
//!   date table in lockstep with the entries.
//! - A production date per key, consulted by the staleness policy
//!   ([`BatchRequest::is_expired`] plus the [`CacheConfig::max_age`]
//!   convenience TTL).
//! - A table of in-flight production tokens. A token is the exclusive right
//!   to produce one key; it exists only while a producer runs for that key.
//!
//! ## Resolution
//!
//! [`Cacher::get_many`] partitions the requested keys into fresh cache hits,
//! keys this call wins the production token for, and keys another caller is
//! already producing. The won keys are handed to
//! [`BatchRequest::produce_many`] as one batch; the contended keys are waited
//! on and re-checked once their producer finishes, because that production
//! may have failed or its entry may already have been reclaimed again. The
//! cycle repeats until every requested key has a value (possibly `None`, for
//! keys the producer returned nothing for).
//!
//! Locking is strictly per key: unrelated batches produce concurrently, and
//! no lock is held across a producer invocation. Tokens are returned
//! unconditionally when a production ends, whether it succeeded, failed, or
//! was cancelled, so a failing producer never leaves other callers blocked.
//!
//! ## Re-entrant production
//!
//! A producer may call back into the same cache for *different* keys. If a
//! production, directly or through nested calls, requests a key its own
//! logical execution context is already producing, the call fails with
//! [`CacheError::Deadlock`] instead of waiting on itself forever. Context
//! identity is carried in a task-local, so nested calls made while a
//! producer's future is being polled are attributed to the outer call.
//!
//! ## Errors
//!
//! Producer failures surface as [`CacheError::Producer`], annotated with the
//! key batch that failed. Failed keys keep whatever cached state they had
//! before the attempt; a later call is free to retry them. Deadlocks are
//! never retried.

mod cacher;
mod config;
mod context;
mod error;
mod request;
mod store;
mod utils;


pub use cacher::Cacher;
pub use config::CacheConfig;
pub use error::{CacheError, ProducerError};
pub use request::{BatchRequest, ProducedBatch};
