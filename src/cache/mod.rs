//! Cache key derivation and the pluggable cache store.

pub mod key;
pub mod store;

pub use key::{cache_key, KeyContext};
pub use store::{CacheEntry, CacheStore, MemoryCacheStore};
