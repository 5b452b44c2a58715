use std::collections::HashMap;
use std::sync::Arc;

use super::{load_entry, RepoError};
use crate::cache::Cache;
use crate::domain::{feature_config_key, CacheEntry, EnvironmentId, FeatureFlag};

/// Feature flag sets keyed by environment.
pub struct FeatureFlagRepo {
    cache: Arc<dyn Cache>,
}

impl FeatureFlagRepo {
    /// Creates the repository and write-throughs the full seed in one pass.
    pub async fn new(
        cache: Arc<dyn Cache>,
        seed: HashMap<EnvironmentId, Vec<FeatureFlag>>,
    ) -> Result<Self, RepoError> {
        let repo = Self { cache };
        for (environment, flags) in seed {
            repo.setup(&environment, flags).await?;
        }
        Ok(repo)
    }

    /// Replaces the environment's entire flag set with a single write, so
    /// readers observe either the old set or the new one.
    pub async fn setup(
        &self,
        environment: &str,
        flags: Vec<FeatureFlag>,
    ) -> Result<(), RepoError> {
        let bytes = CacheEntry::FeatureFlags(flags).encode()?;
        self.cache
            .set(&feature_config_key(environment), bytes)
            .await?;
        Ok(())
    }

    pub async fn get_all(&self, environment: &str) -> Result<Vec<FeatureFlag>, RepoError> {
        let key = feature_config_key(environment);
        match load_entry(self.cache.as_ref(), &key).await? {
            Some(CacheEntry::FeatureFlags(flags)) => Ok(flags),
            Some(_) => {
                tracing::warn!(key = %key, "deleting cache entry with unexpected shape");
                self.cache.delete(&key).await?;
                Err(RepoError::NotFound)
            }
            None => Err(RepoError::NotFound),
        }
    }

    pub async fn get(
        &self,
        environment: &str,
        identifier: &str,
    ) -> Result<FeatureFlag, RepoError> {
        self.get_all(environment)
            .await?
            .into_iter()
            .find(|flag| flag.identifier == identifier)
            .ok_or(RepoError::NotFound)
    }

    /// Incrementally upserts flags by identifier, preserving set order for
    /// existing entries.
    pub async fn add(
        &self,
        environment: &str,
        flags: Vec<FeatureFlag>,
    ) -> Result<(), RepoError> {
        let mut current = match self.get_all(environment).await {
            Ok(flags) => flags,
            Err(RepoError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };

        for flag in flags {
            match current.iter_mut().find(|f| f.identifier == flag.identifier) {
                Some(existing) => *existing = flag,
                None => current.push(flag),
            }
        }

        self.setup(environment, current).await
    }

    pub async fn remove(&self, environment: &str, identifier: &str) -> Result<(), RepoError> {
        let mut current = match self.get_all(environment).await {
            Ok(flags) => flags,
            Err(RepoError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        current.retain(|flag| flag.identifier != identifier);
        self.setup(environment, current).await
    }
}
