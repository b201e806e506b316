//! Application-level caching.
//!
//! This module provides a fingerprint-keyed request cache that:
//! - Serves entries younger than a per-call `max_age` without touching the network
//! - Collapses concurrent requests for the same fingerprint into one operation
//! - Serves stale entries immediately while refreshing them in the background
//! - Never caches failures

mod layer;
mod traits;

pub use layer::{FetchOptions, RequestCache};
pub use traits::{CacheEntry, CacheResult, CacheSource};
