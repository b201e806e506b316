//! Two-tier offline cache.
//!
//! The persistent tier ([`sw`]) intercepts requests, classifies them and
//! serves them from versioned buckets according to per-class strategies.
//! The application tier ([`cache`], [`query`]) deduplicates concurrent
//! requests in-process and layers retry and refetch policies on top.

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod logging;
pub mod net;
pub mod query;
pub mod sw;

#[cfg(test)]
mod testing;

pub use cache::{CacheResult, CacheSource, FetchOptions, RequestCache};
pub use error::{FetchError, LifecycleError};
pub use query::{use_query, QueryConfig, QueryController, QueryState, QueryStatus};
pub use sw::OfflineWorker;
