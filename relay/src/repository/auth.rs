use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{load_entry, RepoError};
use crate::cache::Cache;
use crate::domain::{auth_key, AuthConfig, CacheEntry, EnvironmentId, AUTH_KEY_PREFIX};

/// API-key to environment bindings.
///
/// When an approved-environments set is configured non-empty, bindings for
/// other environments are dropped at load and never become visible to any
/// caller. The filter is also re-checked on reads so a reconfigured
/// allow-list takes effect against an already-populated cache.
pub struct AuthRepo {
    cache: Arc<dyn Cache>,
    approved_envs: HashSet<EnvironmentId>,
}

impl AuthRepo {
    pub async fn new(
        cache: Arc<dyn Cache>,
        seed: HashMap<String, EnvironmentId>,
        approved_envs: HashSet<EnvironmentId>,
    ) -> Result<Self, RepoError> {
        let repo = Self {
            cache,
            approved_envs,
        };
        let configs = seed
            .into_iter()
            .map(|(api_key, environment)| AuthConfig {
                api_key,
                environment,
            })
            .collect();
        repo.add(configs).await?;
        Ok(repo)
    }

    fn approved(&self, environment: &str) -> bool {
        self.approved_envs.is_empty() || self.approved_envs.contains(environment)
    }

    pub async fn add(&self, configs: Vec<AuthConfig>) -> Result<(), RepoError> {
        for config in configs {
            if !self.approved(&config.environment) {
                tracing::debug!(
                    environment = %config.environment,
                    "dropping auth binding for unapproved environment"
                );
                continue;
            }
            let bytes = CacheEntry::Environment(config.environment).encode()?;
            self.cache.set(&auth_key(&config.api_key), bytes).await?;
        }
        Ok(())
    }

    pub async fn get(&self, api_key: &str) -> Result<EnvironmentId, RepoError> {
        let key = auth_key(api_key);
        match load_entry(self.cache.as_ref(), &key).await? {
            Some(CacheEntry::Environment(environment)) if self.approved(&environment) => {
                Ok(environment)
            }
            Some(CacheEntry::Environment(_)) | None => Err(RepoError::NotFound),
            Some(_) => {
                tracing::warn!(key = %key, "deleting cache entry with unexpected shape");
                self.cache.delete(&key).await?;
                Err(RepoError::NotFound)
            }
        }
    }

    pub async fn get_all(&self) -> Result<HashMap<String, EnvironmentId>, RepoError> {
        let mut bindings = HashMap::new();
        for (key, bytes) in self.cache.scan(AUTH_KEY_PREFIX).await? {
            let Some(api_key) = key.strip_prefix(AUTH_KEY_PREFIX) else {
                continue;
            };
            match CacheEntry::decode(&bytes) {
                Ok(CacheEntry::Environment(environment)) if self.approved(&environment) => {
                    bindings.insert(api_key.to_string(), environment);
                }
                Ok(CacheEntry::Environment(_)) => {}
                Ok(_) | Err(_) => {
                    tracing::warn!(key = %key, "deleting corrupt auth binding");
                    self.cache.delete(&key).await?;
                }
            }
        }
        Ok(bindings)
    }

    pub async fn remove(&self, api_key: &str) -> Result<(), RepoError> {
        self.cache.delete(&auth_key(api_key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;

    fn bindings(pairs: &[(&str, &str)]) -> HashMap<String, EnvironmentId> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn repo(
        seed: HashMap<String, EnvironmentId>,
        approved: &[&str],
    ) -> AuthRepo {
        AuthRepo::new(
            Arc::new(MemCache::new()),
            seed,
            approved.iter().map(|e| e.to_string()).collect(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn get_with_empty_repo() {
        let repo = repo(HashMap::new(), &[]).await;
        assert!(matches!(
            repo.get("apikey-foo").await,
            Err(RepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn get_known_and_unknown_keys() {
        let repo = repo(bindings(&[("apikey-foo", "env-approved")]), &[]).await;

        assert_eq!(repo.get("apikey-foo").await.unwrap(), "env-approved");
        assert!(matches!(repo.get("foo").await, Err(RepoError::NotFound)));
    }

    #[tokio::test]
    async fn allow_list_hides_unapproved_bindings() {
        let repo = repo(
            bindings(&[
                ("apikey-foo", "env-approved"),
                ("apikey-2", "env-not-approved"),
            ]),
            &["env-approved"],
        )
        .await;

        assert_eq!(repo.get("apikey-foo").await.unwrap(), "env-approved");
        assert!(matches!(
            repo.get("apikey-2").await,
            Err(RepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn get_all_respects_allow_list() {
        let seed = bindings(&[("apikey-foo", "env-foo"), ("apikey-bar", "env-bar")]);

        let unfiltered = repo(seed.clone(), &[]).await;
        assert_eq!(unfiltered.get_all().await.unwrap(), seed);

        let filtered = repo(seed.clone(), &["env-foo"]).await;
        assert_eq!(
            filtered.get_all().await.unwrap(),
            bindings(&[("apikey-foo", "env-foo")])
        );

        let none = repo(seed, &["env-noexist"]).await;
        assert!(none.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_after_construction_merges() {
        let repo = repo(bindings(&[("apikey-foo", "env-foo")]), &[]).await;

        repo.add(vec![AuthConfig {
            api_key: "apikey-extra".to_string(),
            environment: "env-extra".to_string(),
        }])
        .await
        .unwrap();

        assert_eq!(
            repo.get_all().await.unwrap(),
            bindings(&[("apikey-foo", "env-foo"), ("apikey-extra", "env-extra")])
        );
    }

    #[tokio::test]
    async fn add_for_unapproved_environment_is_dropped() {
        let repo = repo(HashMap::new(), &["env-approved"]).await;

        repo.add(vec![AuthConfig {
            api_key: "apikey-2".to_string(),
            environment: "env-not-approved".to_string(),
        }])
        .await
        .unwrap();

        assert!(matches!(
            repo.get("apikey-2").await,
            Err(RepoError::NotFound)
        ));
        assert!(repo.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_binding() {
        let repo = repo(bindings(&[("apikey-foo", "env-foo")]), &[]).await;

        repo.remove("apikey-foo").await.unwrap();
        assert!(matches!(
            repo.get("apikey-foo").await,
            Err(RepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn shared_cache_accumulates_across_constructions() {
        // a second construction against the same cache merges rather than
        // clearing other environments' keys
        let cache: Arc<dyn Cache> = Arc::new(MemCache::new());

        AuthRepo::new(
            cache.clone(),
            bindings(&[("apikey-foo", "env-foo"), ("apikey-foo2", "env-foo")]),
            HashSet::new(),
        )
        .await
        .unwrap();

        let repo = AuthRepo::new(
            cache,
            bindings(&[("apikey-bar", "env-bar")]),
            HashSet::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            repo.get_all().await.unwrap(),
            bindings(&[
                ("apikey-foo", "env-foo"),
                ("apikey-foo2", "env-foo"),
                ("apikey-bar", "env-bar"),
            ])
        );
    }
}
