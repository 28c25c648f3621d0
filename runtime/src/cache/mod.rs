//! Content-addressed cache for downloaded image content.
//!
//! A single `ImageCache` is shared by every build on the host. Entries are
//! grouped by [`CacheKind`] and never mutated once committed.

pub mod blob_cache;

pub use blob_cache::{CacheEntry, CacheKind, CleanPolicy, CleanReport, ImageCache, PendingBlob};
