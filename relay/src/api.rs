//! Inbound SDK surface. Handlers are thin: they check the request-scoped
//! environment claim and delegate to the repositories and services.

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::auth::{AuthError, AuthService};
use crate::domain::{EnvironmentId, FeatureFlag, Metrics, Segment, TargetData};
use crate::metric_service::MetricService;
use crate::repository::{FeatureFlagRepo, RepoError, SegmentRepo, TargetRepo};
use crate::stream::ChangeEvent;

const SSE_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// The verified environment claim, inserted by the auth middleware so
/// handlers never re-parse the token.
#[derive(Clone, Debug)]
pub struct EnvironmentClaim(pub EnvironmentId);

#[derive(Clone)]
pub struct ApiState {
    pub auth: Arc<AuthService>,
    pub flags: Arc<FeatureFlagRepo>,
    pub segments: Arc<SegmentRepo>,
    pub targets: Arc<TargetRepo>,
    pub metrics: MetricService,
    pub events: broadcast::Sender<ChangeEvent>,
    pub ready: Arc<AtomicBool>,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("temporarily unavailable")]
    Unavailable,
    #[error("internal error")]
    Internal,
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized => ApiError::Unauthorized,
            AuthError::StoreUnavailable(_) => ApiError::Unavailable,
            AuthError::TokenEncoding(_) => ApiError::Internal,
        }
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Cache(_) => ApiError::Unavailable,
            RepoError::Codec(_) => ApiError::Internal,
        }
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let guarded = Router::new()
        .route("/client/env/:environment/feature-configs", get(feature_configs))
        .route(
            "/client/env/:environment/feature-configs/:identifier",
            get(feature_config),
        )
        .route("/client/env/:environment/target-segments", get(target_segments))
        .route(
            "/client/env/:environment/target-segments/:identifier",
            get(target_segment),
        )
        .route("/metrics/:environment", post(post_metrics))
        .route("/stream", get(stream))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/client/auth", post(authenticate))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .merge(guarded)
        .with_state(state)
}

async fn require_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let environment = state.auth.verify(token).await?;
    request.extensions_mut().insert(EnvironmentClaim(environment));
    Ok(next.run(request).await)
}

fn check_claim(claim: &EnvironmentClaim, environment: &str) -> Result<(), ApiError> {
    if claim.0 == environment {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticateRequest {
    api_key: String,
    #[serde(default)]
    target: Option<TargetData>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticateResponse {
    auth_token: String,
}

async fn authenticate(
    State(state): State<ApiState>,
    Json(body): Json<AuthenticateRequest>,
) -> Result<Json<AuthenticateResponse>, ApiError> {
    let auth_token = state.auth.authenticate(&body.api_key).await?;

    // the handshake may carry the connecting target; register it so segment
    // membership reflects it before the next target poll
    if let Some(target) = body.target {
        let environment = state.auth.verify(&auth_token).await?;
        let target = crate::domain::Target {
            identifier: target.identifier,
            name: target.name,
            attributes: target
                .attributes
                .into_iter()
                .map(|kv| (kv.key, kv.value))
                .collect(),
            segments: vec![],
        };
        if let Err(e) = state.targets.add(&environment, vec![target]).await {
            tracing::debug!(error = %e, "could not register connecting target");
        }
    }

    Ok(Json(AuthenticateResponse { auth_token }))
}

async fn feature_configs(
    State(state): State<ApiState>,
    Path(environment): Path<String>,
    Extension(claim): Extension<EnvironmentClaim>,
) -> Result<Json<Vec<FeatureFlag>>, ApiError> {
    check_claim(&claim, &environment)?;
    Ok(Json(state.flags.get_all(&environment).await?))
}

async fn feature_config(
    State(state): State<ApiState>,
    Path((environment, identifier)): Path<(String, String)>,
    Extension(claim): Extension<EnvironmentClaim>,
) -> Result<Json<FeatureFlag>, ApiError> {
    check_claim(&claim, &environment)?;
    Ok(Json(state.flags.get(&environment, &identifier).await?))
}

async fn target_segments(
    State(state): State<ApiState>,
    Path(environment): Path<String>,
    Extension(claim): Extension<EnvironmentClaim>,
) -> Result<Json<Vec<Segment>>, ApiError> {
    check_claim(&claim, &environment)?;
    Ok(Json(state.segments.get_all(&environment).await?))
}

async fn target_segment(
    State(state): State<ApiState>,
    Path((environment, identifier)): Path<(String, String)>,
    Extension(claim): Extension<EnvironmentClaim>,
) -> Result<Json<Segment>, ApiError> {
    check_claim(&claim, &environment)?;
    Ok(Json(state.segments.get(&environment, &identifier).await?))
}

async fn post_metrics(
    State(state): State<ApiState>,
    Path(environment): Path<String>,
    Extension(claim): Extension<EnvironmentClaim>,
    Json(batch): Json<Metrics>,
) -> Result<StatusCode, ApiError> {
    check_claim(&claim, &environment)?;
    state.metrics.store_metrics(&environment, batch);
    Ok(StatusCode::OK)
}

/// Rebroadcasts applied change events for the caller's environment.
async fn stream(
    State(state): State<ApiState>,
    Extension(claim): Extension<EnvironmentClaim>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    let environment = claim.0;

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) if event.environment == environment => {
                        let data = serde_json::json!({
                            "environment": event.environment,
                            "identifier": event.identifier,
                            "version": event.version,
                        });
                        yield Ok(Event::default()
                            .event(event.kind_name())
                            .data(data.to_string()));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "sse subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(SSE_HEARTBEAT_PERIOD) => {
                    yield Ok(Event::default().event("heartbeat").data("{}"));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn health() -> &'static str {
    "ok\n"
}

async fn ready(State(state): State<ApiState>) -> Response {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok\n").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready\n").into_response()
    }
}
