/*!
Store implementations of the cache contract.
*/

mod hybrid;
mod memory;
mod null;
mod scoped;

pub use hybrid::{HybridAwareCache, HybridCache, HybridCacheBuilder};
pub use memory::{ExpiredEntry, InMemoryCache, InMemoryCacheBuilder};
pub use null::NullCache;
pub use scoped::ScopedCache;
