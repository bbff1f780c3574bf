pub(crate) mod key_set;
pub(crate) mod loading;

pub use key_set::LruKeySet;
pub use loading::{LoadingCache, LoadingCacheConfig};
