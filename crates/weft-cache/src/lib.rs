//! Multi-tier cache for the Weft workflow runtime.
//!
//! A memory tier with LRU eviction and a disk tier with one JSON file per
//! entry, usable alone or together (hybrid write-through with promotion of
//! disk hits into memory). Every entry has its own TTL.
//!
//! # Main types
//!
//! - [`Cache`] — The cache itself: `get`, `set`, `delete`, `clear`, sweeper.
//! - [`CacheConfig`] / [`CacheMode`] — Tier selection and budgets.
//! - [`CacheEntry`] — A stored value with TTL and access bookkeeping.
//! - [`CacheEvent`] — Hit/miss/set/evicted/expired/cleared notifications.
//! - [`memoize`] — Wrap a unit of work so equal keys skip execution.

/// The cache front end and statistics.
pub mod cache;
/// Cache configuration.
pub mod config;
mod disk;
/// Stored entries and tiers.
pub mod entry;
/// Cache events.
pub mod events;
/// Memoization helper.
pub mod memoize;
mod memory;

pub use cache::{Cache, CacheStats};
pub use config::{CacheConfig, CacheMode};
pub use disk::entry_file_name;
pub use entry::{CacheEntry, CacheTier};
pub use events::{CacheEvent, EvictionReason};
pub use memoize::{memoize, Memoized};
