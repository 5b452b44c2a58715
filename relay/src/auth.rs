//! SDK authentication: API key in, short-lived HS256 JWT out.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use moka::sync::Cache as TtlCache;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use shared::counter;

use crate::domain::{Claims, EnvironmentId};
use crate::metrics_defs::{UNKNOWN_KEY_CACHE_HIT, UNKNOWN_KEY_CACHE_MISS};
use crate::repository::{AuthRepo, RepoError};

const TOKEN_ISSUER: &str = "flagrelay";
const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

// Unknown keys are cached briefly so a misconfigured SDK hammering the auth
// endpoint does not hammer the cache backend too.
const UNKNOWN_KEY_CACHE_SIZE: u64 = 1000;
const UNKNOWN_KEY_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("auth store unavailable: {0}")]
    StoreUnavailable(RepoError),
    #[error("token encoding failed: {0}")]
    TokenEncoding(#[from] jsonwebtoken::errors::Error),
}

pub struct AuthService {
    repo: Arc<AuthRepo>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    bypass: bool,
    unknown_keys: TtlCache<String, ()>,
}

impl AuthService {
    pub fn new(repo: Arc<AuthRepo>, secret: &str, bypass: bool) -> Self {
        Self {
            repo,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            bypass,
            unknown_keys: TtlCache::builder()
                .max_capacity(UNKNOWN_KEY_CACHE_SIZE)
                .time_to_live(UNKNOWN_KEY_CACHE_TTL)
                .build(),
        }
    }

    /// Exchanges an SDK API key for a signed token bound to the key's
    /// environment.
    pub async fn authenticate(&self, api_key: &str) -> Result<String, AuthError> {
        if self.bypass {
            let environment = self.first_environment().await?;
            return self.mint(environment);
        }

        if self.unknown_keys.contains_key(api_key) {
            counter!(UNKNOWN_KEY_CACHE_HIT).increment(1);
            return Err(AuthError::Unauthorized);
        }
        counter!(UNKNOWN_KEY_CACHE_MISS).increment(1);

        match self.repo.get(api_key).await {
            Ok(environment) => self.mint(environment),
            Err(RepoError::NotFound) => {
                self.unknown_keys.insert(api_key.to_string(), ());
                Err(AuthError::Unauthorized)
            }
            Err(e) => Err(AuthError::StoreUnavailable(e)),
        }
    }

    /// Verifies signature and expiry, returning the environment claim.
    pub async fn verify(&self, token: &str) -> Result<EnvironmentId, AuthError> {
        if self.bypass {
            return self.first_environment().await;
        }

        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.environment)
            .map_err(|e| {
                tracing::debug!(error = %e, "rejected token");
                AuthError::Unauthorized
            })
    }

    fn mint(&self, environment: EnvironmentId) -> Result<String, AuthError> {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as usize
            + TOKEN_LIFETIME.as_secs() as usize;

        let claims = Claims {
            environment,
            iss: TOKEN_ISSUER.to_string(),
            exp,
        };
        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    /// Synthetic environment for bypass mode: the first binding by key
    /// order, so local development is deterministic.
    async fn first_environment(&self) -> Result<EnvironmentId, AuthError> {
        let bindings = self
            .repo
            .get_all()
            .await
            .map_err(AuthError::StoreUnavailable)?;
        bindings
            .into_iter()
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, environment)| environment)
            .ok_or(AuthError::Unauthorized)
    }
}

/// Reads the environment claim out of an upstream-issued token without
/// verifying it; we do not hold upstream's signing key.
pub fn environment_from_token(token: &str) -> Result<EnvironmentId, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims.environment)
        .map_err(|e| {
            tracing::debug!(error = %e, "could not read environment from upstream token");
            AuthError::Unauthorized
        })
}
