//! In-memory response caching and request coalescing.
//!
//! [`TtlCache`] stores decoded responses with a per-entry lifetime and
//! [`RequestCoordinator`] makes sure at most one fetch per key is running.

pub mod cache;
pub mod coordinator;

pub use cache::{CacheEntry, TtlCache};
pub use coordinator::RequestCoordinator;
