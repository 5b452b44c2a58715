use std::collections::HashMap;
use std::sync::Arc;

use super::{load_entry, RepoError};
use crate::cache::Cache;
use crate::domain::{target_key, CacheEntry, EnvironmentId, Target};

/// Target sets keyed by environment. Targets change frequently and are
/// refreshed by their own poll loop.
pub struct TargetRepo {
    cache: Arc<dyn Cache>,
}

impl TargetRepo {
    pub async fn new(
        cache: Arc<dyn Cache>,
        seed: HashMap<EnvironmentId, Vec<Target>>,
    ) -> Result<Self, RepoError> {
        let repo = Self { cache };
        for (environment, targets) in seed {
            repo.setup(&environment, targets).await?;
        }
        Ok(repo)
    }

    pub async fn setup(&self, environment: &str, targets: Vec<Target>) -> Result<(), RepoError> {
        let bytes = CacheEntry::Targets(targets).encode()?;
        self.cache.set(&target_key(environment), bytes).await?;
        Ok(())
    }

    pub async fn get_all(&self, environment: &str) -> Result<Vec<Target>, RepoError> {
        let key = target_key(environment);
        match load_entry(self.cache.as_ref(), &key).await? {
            Some(CacheEntry::Targets(targets)) => Ok(targets),
            Some(_) => {
                tracing::warn!(key = %key, "deleting cache entry with unexpected shape");
                self.cache.delete(&key).await?;
                Err(RepoError::NotFound)
            }
            None => Err(RepoError::NotFound),
        }
    }

    pub async fn get(&self, environment: &str, identifier: &str) -> Result<Target, RepoError> {
        self.get_all(environment)
            .await?
            .into_iter()
            .find(|target| target.identifier == identifier)
            .ok_or(RepoError::NotFound)
    }

    pub async fn add(&self, environment: &str, targets: Vec<Target>) -> Result<(), RepoError> {
        let mut current = match self.get_all(environment).await {
            Ok(targets) => targets,
            Err(RepoError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };

        for target in targets {
            match current
                .iter_mut()
                .find(|t| t.identifier == target.identifier)
            {
                Some(existing) => *existing = target,
                None => current.push(target),
            }
        }

        self.setup(environment, current).await
    }

    pub async fn remove(&self, environment: &str, identifier: &str) -> Result<(), RepoError> {
        let mut current = match self.get_all(environment).await {
            Ok(targets) => targets,
            Err(RepoError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        current.retain(|target| target.identifier != identifier);
        self.setup(environment, current).await
    }
}
