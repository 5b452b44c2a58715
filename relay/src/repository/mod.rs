//! Typed views over the cache, one repository per entity.
//!
//! Repositories own encoding and decoding; the cache only ever sees opaque
//! bytes. Writes are full replacements keyed by identifier. A value that no
//! longer decodes is deleted so the next refresh repopulates it, and the
//! caller sees not-found.

mod auth;
mod feature;
mod segment;
mod target;

pub use auth::AuthRepo;
pub use feature::FeatureFlagRepo;
pub use segment::SegmentRepo;
pub use target::TargetRepo;

use crate::cache::{Cache, CacheError};
use crate::domain::CacheEntry;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Codec(#[from] crate::domain::CodecError),
}

/// Reads and decodes one cache entry, remediating corruption in place.
async fn load_entry(cache: &dyn Cache, key: &str) -> Result<Option<CacheEntry>, RepoError> {
    let Some(bytes) = cache.get(key).await? else {
        return Ok(None);
    };

    match CacheEntry::decode(&bytes) {
        Ok(entry) => Ok(Some(entry)),
        Err(e) => {
            tracing::warn!(key, error = %e, "deleting corrupt cache entry");
            cache.delete(key).await?;
            Ok(None)
        }
    }
}
