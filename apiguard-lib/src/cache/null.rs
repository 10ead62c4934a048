use async_trait::async_trait;
use http::request::Parts;

use super::{Cache, CacheEntry, CacheEntryOptions, CacheError};

/// Cache that never stores anything.
#[derive(Debug, Default)]
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn get(&self, _: &Parts, _: &CacheEntryOptions) -> Result<Option<CacheEntry>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _: &Parts, _: &CacheEntry, _: &CacheEntryOptions) -> Result<(), CacheError> {
        Ok(())
    }
}
