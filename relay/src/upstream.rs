//! Thin hand-written client for the control plane's admin and client APIs.
//!
//! The admin surface (service-token authenticated) is used for bulk fetches
//! and the authoritative read-backs the refresher performs when applying
//! stream events. The client surface handles SDK-key authentication and
//! metric uploads; those attach a per-environment bearer token read from an
//! explicit request-scoped [`RequestContext`].

use rand::Rng;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::Config;
use crate::domain::{EnvironmentId, FeatureFlag, Metrics, Segment, Target};

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;

pub const METRICS_POST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned {0}")]
    Status(StatusCode),
    #[error("no auth token exists in context")]
    NoAuthToken,
}

impl UpstreamError {
    pub fn is_retriable(&self) -> bool {
        match self {
            UpstreamError::Status(code) => RETRIABLE_STATUS_CODES.contains(code),
            UpstreamError::Transport(e) => e.is_timeout() || e.is_connect(),
            UpstreamError::NoAuthToken => false,
        }
    }
}

/// Per-request value carrying the upstream bearer token. Threaded through
/// the call chain explicitly rather than held in process-global state.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    token: Option<String>,
}

impl RequestContext {
    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Runs `op` with exponential backoff between retriable failures: base
/// 500 ms, doubling to a 30 s cap, with ±20% jitter, up to 5 attempts.
pub async fn with_backoff<T, F, Fut>(operation: &str, mut op: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut delay = BACKOFF_BASE;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retriable() || attempt >= MAX_ATTEMPTS => return Err(e),
            Err(e) => {
                let jitter = rand::thread_rng().gen_range(0.8..=1.2);
                tracing::warn!(operation, attempt, error = %e, "retrying upstream call");
                sleep(delay.mul_f64(jitter)).await;
                delay = (delay * 2).min(BACKOFF_CAP);
            }
        }
    }
}

/// An environment returned by the admin bulk fetch, with its API keys.
#[derive(Clone, Debug, Deserialize)]
pub struct EnvironmentSeed {
    pub identifier: EnvironmentId,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Deserialize)]
struct EnvironmentsPage {
    environments: Vec<EnvironmentSeed>,
    metadata: PageMetadata,
}

#[derive(Deserialize)]
struct PageMetadata {
    cursor: String,
    has_more: bool,
}

#[derive(Serialize)]
struct AuthRequestBody<'a> {
    #[serde(rename = "apiKey")]
    api_key: &'a str,
}

#[derive(Deserialize)]
struct AuthResponseBody {
    #[serde(rename = "authToken")]
    auth_token: String,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    admin_url: String,
    client_url: String,
    admin_token: String,
    account: String,
    org: String,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            admin_url: config.admin_url.trim_end_matches('/').to_string(),
            client_url: config.client_url.trim_end_matches('/').to_string(),
            admin_token: config.admin_service_token.clone(),
            account: config.account_identifier.clone(),
            org: config.org_identifier.clone(),
        }
    }

    pub fn client_url(&self) -> &str {
        &self.client_url
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    fn admin_get(&self, path: &str, timeout: Duration) -> RequestBuilder {
        self.client
            .get(format!("{}/{}", self.admin_url, path))
            .bearer_auth(&self.admin_token)
            .query(&[
                ("accountIdentifier", self.account.as_str()),
                ("orgIdentifier", self.org.as_str()),
            ])
            .timeout(timeout)
    }

    fn attach_auth(
        &self,
        request: RequestBuilder,
        ctx: &RequestContext,
    ) -> Result<RequestBuilder, UpstreamError> {
        match &ctx.token {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Err(UpstreamError::NoAuthToken),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, UpstreamError> {
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(response.json::<T>().await?)
    }

    /// Bulk fetch of environments and their API key bindings, following the
    /// cursor until the control plane reports no more pages.
    pub async fn environments(&self) -> Result<Vec<EnvironmentSeed>, UpstreamError> {
        let mut environments = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = self.admin_get("admin/environments", Duration::from_secs(30));
            if let Some(ref c) = cursor {
                request = request.query(&[("cursor", c.as_str())]);
            }

            let page: EnvironmentsPage = Self::read_json(request.send().await?).await?;
            environments.extend(page.environments);

            if !page.metadata.has_more {
                break;
            }
            cursor = Some(page.metadata.cursor);
        }

        Ok(environments)
    }

    pub async fn feature_configs(
        &self,
        environment: &str,
        timeout: Duration,
    ) -> Result<Vec<FeatureFlag>, UpstreamError> {
        let path = format!("admin/environments/{environment}/feature-configs");
        let response = self.admin_get(&path, timeout).send().await?;
        Self::read_json(response).await
    }

    pub async fn feature_config(
        &self,
        environment: &str,
        identifier: &str,
        timeout: Duration,
    ) -> Result<FeatureFlag, UpstreamError> {
        let path = format!("admin/environments/{environment}/feature-configs/{identifier}");
        let response = self.admin_get(&path, timeout).send().await?;
        Self::read_json(response).await
    }

    pub async fn segments(
        &self,
        environment: &str,
        timeout: Duration,
    ) -> Result<Vec<Segment>, UpstreamError> {
        let path = format!("admin/environments/{environment}/target-segments");
        let response = self.admin_get(&path, timeout).send().await?;
        Self::read_json(response).await
    }

    pub async fn segment(
        &self,
        environment: &str,
        identifier: &str,
        timeout: Duration,
    ) -> Result<Segment, UpstreamError> {
        let path = format!("admin/environments/{environment}/target-segments/{identifier}");
        let response = self.admin_get(&path, timeout).send().await?;
        Self::read_json(response).await
    }

    pub async fn targets(
        &self,
        environment: &str,
        timeout: Duration,
    ) -> Result<Vec<Target>, UpstreamError> {
        let path = format!("admin/environments/{environment}/targets");
        let response = self.admin_get(&path, timeout).send().await?;
        Self::read_json(response).await
    }

    pub async fn target(
        &self,
        environment: &str,
        identifier: &str,
        timeout: Duration,
    ) -> Result<Target, UpstreamError> {
        let path = format!("admin/environments/{environment}/targets/{identifier}");
        let response = self.admin_get(&path, timeout).send().await?;
        Self::read_json(response).await
    }

    /// Exchanges an SDK API key for an upstream bearer token.
    pub async fn authenticate(&self, api_key: &str) -> Result<String, UpstreamError> {
        let response = self
            .client
            .post(format!("{}/client/auth", self.client_url))
            .json(&AuthRequestBody { api_key })
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let body: AuthResponseBody = Self::read_json(response).await?;
        Ok(body.auth_token)
    }

    pub async fn post_metrics(
        &self,
        environment: &str,
        metrics: &Metrics,
        ctx: &RequestContext,
    ) -> Result<(), UpstreamError> {
        let request = self
            .client
            .post(format!("{}/metrics/{environment}", self.client_url))
            .json(metrics)
            .timeout(METRICS_POST_TIMEOUT);
        let response = self.attach_auth(request, ctx)?.send().await?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(())
    }

    /// Upstream liveness probe used by the heartbeat.
    pub async fn ping(&self, timeout: Duration) -> Result<(), UpstreamError> {
        let response = self
            .client
            .get(format!("{}/health", self.client_url))
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testsupport::minimal_config;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate, Respond};

    fn client_for(server: &MockServer) -> UpstreamClient {
        UpstreamClient::new(&minimal_config(&server.uri()))
    }

    #[tokio::test]
    async fn environments_follow_cursor_pages() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/admin/environments"))
            .and(query_param("accountIdentifier", "account"))
            .and(query_param("cursor", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"environments":[{"identifier":"env-b","api_keys":[]}],
                    "metadata":{"cursor":"","has_more":false}}"#,
            ))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/admin/environments"))
            .and(query_param("accountIdentifier", "account"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"environments":[{"identifier":"env-a","api_keys":["apikey-foo"]}],
                    "metadata":{"cursor":"page-2","has_more":true}}"#,
            ))
            .mount(&server)
            .await;

        let environments = client_for(&server).environments().await.unwrap();
        let identifiers: Vec<_> = environments.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(identifiers, vec!["env-a", "env-b"]);
        assert_eq!(environments[0].api_keys, vec!["apikey-foo"]);
    }

    #[tokio::test]
    async fn authenticate_returns_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/client/auth"))
            .and(body_json(serde_json::json!({"apiKey": "apikey-foo"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"authToken":"token-123"}"#),
            )
            .mount(&server)
            .await;

        let token = client_for(&server).authenticate("apikey-foo").await.unwrap();
        assert_eq!(token, "token-123");
    }

    #[tokio::test]
    async fn post_metrics_requires_context_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/metrics/123"))
            .and(header("authorization", "Bearer token-123"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let metrics = Metrics::default();

        let err = client
            .post_metrics("123", &metrics, &RequestContext::empty())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no auth token exists in context");

        client
            .post_metrics(
                "123",
                &metrics,
                &RequestContext::with_token("token-123".to_string()),
            )
            .await
            .unwrap();
    }

    struct FailThenSucceed {
        calls: AtomicU32,
    }

    impl Respond for FailThenSucceed {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(200).set_body_string("[]")
            }
        }
    }

    #[tokio::test]
    async fn with_backoff_recovers_from_5xx() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/admin/environments/env-a/feature-configs"))
            .respond_with(FailThenSucceed {
                calls: AtomicU32::new(0),
            })
            .mount(&server)
            .await;

        let client = client_for(&server);
        let flags = with_backoff("fetch flags", || {
            client.feature_configs("env-a", Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(flags.is_empty());
    }

    #[tokio::test]
    async fn with_backoff_gives_up_on_non_retriable_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/admin/environments/env-a/feature-configs"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = with_backoff("fetch flags", || {
            client.feature_configs("env-a", Duration::from_secs(5))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, UpstreamError::Status(StatusCode::NOT_FOUND)));
    }
}
