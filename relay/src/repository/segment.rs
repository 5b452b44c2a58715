use std::collections::HashMap;
use std::sync::Arc;

use super::{load_entry, RepoError};
use crate::cache::Cache;
use crate::domain::{segment_key, CacheEntry, EnvironmentId, Segment};

/// Segment sets keyed by environment.
pub struct SegmentRepo {
    cache: Arc<dyn Cache>,
}

impl SegmentRepo {
    pub async fn new(
        cache: Arc<dyn Cache>,
        seed: HashMap<EnvironmentId, Vec<Segment>>,
    ) -> Result<Self, RepoError> {
        let repo = Self { cache };
        for (environment, segments) in seed {
            repo.setup(&environment, segments).await?;
        }
        Ok(repo)
    }

    pub async fn setup(&self, environment: &str, segments: Vec<Segment>) -> Result<(), RepoError> {
        let bytes = CacheEntry::Segments(segments).encode()?;
        self.cache.set(&segment_key(environment), bytes).await?;
        Ok(())
    }

    pub async fn get_all(&self, environment: &str) -> Result<Vec<Segment>, RepoError> {
        let key = segment_key(environment);
        match load_entry(self.cache.as_ref(), &key).await? {
            Some(CacheEntry::Segments(segments)) => Ok(segments),
            Some(_) => {
                tracing::warn!(key = %key, "deleting cache entry with unexpected shape");
                self.cache.delete(&key).await?;
                Err(RepoError::NotFound)
            }
            None => Err(RepoError::NotFound),
        }
    }

    pub async fn get(&self, environment: &str, identifier: &str) -> Result<Segment, RepoError> {
        self.get_all(environment)
            .await?
            .into_iter()
            .find(|segment| segment.identifier == identifier)
            .ok_or(RepoError::NotFound)
    }

    pub async fn add(&self, environment: &str, segments: Vec<Segment>) -> Result<(), RepoError> {
        let mut current = match self.get_all(environment).await {
            Ok(segments) => segments,
            Err(RepoError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };

        for segment in segments {
            match current
                .iter_mut()
                .find(|s| s.identifier == segment.identifier)
            {
                Some(existing) => *existing = segment,
                None => current.push(segment),
            }
        }

        self.setup(environment, current).await
    }

    pub async fn remove(&self, environment: &str, identifier: &str) -> Result<(), RepoError> {
        let mut current = match self.get_all(environment).await {
            Ok(segments) => segments,
            Err(RepoError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        current.retain(|segment| segment.identifier != identifier);
        self.setup(environment, current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;
    use crate::domain::testdata;

    #[tokio::test]
    async fn seed_then_replace() {
        let seed = HashMap::from([(
            "env-a".to_string(),
            vec![testdata::segment("beta-testers", 1)],
        )]);
        let repo = SegmentRepo::new(Arc::new(MemCache::new()), seed)
            .await
            .unwrap();

        assert!(repo.get("env-a", "beta-testers").await.is_ok());

        repo.setup("env-a", vec![testdata::segment("internal", 1)])
            .await
            .unwrap();

        assert!(matches!(
            repo.get("env-a", "beta-testers").await,
            Err(RepoError::NotFound)
        ));
        assert!(repo.get("env-a", "internal").await.is_ok());
    }

    #[tokio::test]
    async fn add_and_remove() {
        let repo = SegmentRepo::new(Arc::new(MemCache::new()), HashMap::new())
            .await
            .unwrap();

        repo.add("env-a", vec![testdata::segment("beta-testers", 1)])
            .await
            .unwrap();
        repo.add("env-a", vec![testdata::segment("beta-testers", 4)])
            .await
            .unwrap();

        let segments = repo.get_all("env-a").await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].version, 4);

        repo.remove("env-a", "beta-testers").await.unwrap();
        assert!(repo.get_all("env-a").await.unwrap().is_empty());
    }
}
