//! # Media cache
//!
//! The cache keeps local copies of remote media around while they are in use, and for a while
//! after. It is made up of two layers:
//!
//! - A [`CacheRegistry`] mapping each [`ResourceKey`](crate::types::ResourceKey) to exactly one
//!   [`CacheEntry`]. The registry bounds the number of resident entries and evicts the least
//!   recently touched unreferenced entry when a new one needs room.
//! - The [`CacheEntry`] itself, which owns a [`Fetcher`](crate::fetch::Fetcher) and counts the
//!   references handed out to consumers.
//!
//! A consumer asks the registry for an entry, which takes a reference on it. It then asks the
//! entry for its file; the first such request starts the fetch and concurrent requests wait for
//! the same fetch. When the consumer is done with the file it releases its reference.
//!
//! ```text
//! get_cache -> get_file -> (use the file) -> release
//! ```
//!
//! ### Eviction
//!
//! Capacity is a soft target. Entries with outstanding references are pinned. When every
//! resident entry is pinned, new entries are admitted anyway and the registry shrinks back on
//! later insertions once references have been released. Evicting an entry that is still
//! fetching cancels the fetch. Evicted entries delete their file, and holders of an evicted
//! entry observe it as cancelled.
//!
//! ### Errors
//!
//! A failed fetch is final for the lifetime of its entry. Later requests report the stored
//! error without contacting the source again. To retry, the entry has to be
//! [invalidated](CacheRegistry::invalidate) first.
//!
//! ### Metrics
//!
//! - `cache.access`: All lookups through [`CacheRegistry::get_cache`].
//! - `cache.hit`: Lookups served by a resident entry.
//! - `cache.evict`: Entries evicted to make room.
//! - `cache.overflow`: Insertions that exceeded the capacity because every entry was referenced.
//! - `cache.count`: Gauge of resident entries.

mod entry;
mod registry;


pub use entry::CacheEntry;
pub use registry::{CacheRegistry, CacheStatistics, KeyProgressFn};
