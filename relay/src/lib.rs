pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod domain;
pub mod heartbeat;
pub mod metric_service;
pub mod metrics_defs;
pub mod refresher;
pub mod repository;
pub mod stream;
pub mod token;
pub mod upstream;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use api::ApiState;
use auth::AuthService;
use cache::{Cache, CacheError, MemCache, RedisCache};
use config::{Config, ConfigError};
use domain::EnvironmentId;
use metric_service::MetricService;
use refresher::{Command, Refresher, RefresherSettings};
use repository::{AuthRepo, FeatureFlagRepo, RepoError, SegmentRepo, TargetRepo};
use token::TokenRegistry;
use upstream::{with_backoff, UpstreamClient, UpstreamError};

const SEED_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_PING_TIMEOUT: Duration = Duration::from_secs(5);
// Idle timeout for the stream when the heartbeat is disabled by config.
const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not connect to cache: {0}")]
    Cache(CacheError),
    #[error("upstream unreachable during startup: {0}")]
    Seed(#[from] UpstreamError),
    #[error("could not seed repositories: {0}")]
    SeedStore(#[from] RepoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Seeds the cache, spawns the background loops, and serves the SDK surface
/// until shutdown.
pub async fn run(config: Config) -> Result<(), RunError> {
    config.validate()?;

    let cache: Arc<dyn Cache> = match &config.redis {
        Some(redis) => {
            tracing::info!(address = %redis.address, "using redis cache");
            Arc::new(RedisCache::connect(redis).await.map_err(RunError::Cache)?)
        }
        None => Arc::new(MemCache::new()),
    };

    let upstream = Arc::new(UpstreamClient::new(&config));

    // Bulk fetch environments and their key bindings. Startup cannot
    // proceed without them; bounded retries, then fatal.
    let seeds = with_backoff("fetch environments", || upstream.environments()).await?;
    let environments: Vec<EnvironmentId> =
        seeds.iter().map(|seed| seed.identifier.clone()).collect();
    tracing::info!(environments = environments.len(), "fetched environment seeds");

    let bindings: HashMap<String, EnvironmentId> = seeds
        .iter()
        .flat_map(|seed| {
            seed.api_keys
                .iter()
                .map(|api_key| (api_key.clone(), seed.identifier.clone()))
        })
        .collect();

    let approved: HashSet<EnvironmentId> = config.approved_environments.iter().cloned().collect();
    let auth_repo = Arc::new(AuthRepo::new(cache.clone(), bindings, approved).await?);

    // Every environment gets all three entity sets, possibly empty, before
    // the relay declares itself ready.
    let mut flag_seed = HashMap::new();
    let mut segment_seed = HashMap::new();
    let mut target_seed = HashMap::new();
    for environment in &environments {
        let flags = with_backoff("seed feature flags", || {
            upstream.feature_configs(environment, SEED_FETCH_TIMEOUT)
        })
        .await?;
        let segments = with_backoff("seed segments", || {
            upstream.segments(environment, SEED_FETCH_TIMEOUT)
        })
        .await?;
        let targets = with_backoff("seed targets", || {
            upstream.targets(environment, SEED_FETCH_TIMEOUT)
        })
        .await?;

        flag_seed.insert(environment.clone(), flags);
        segment_seed.insert(environment.clone(), segments);
        target_seed.insert(environment.clone(), targets);
    }

    let flags = Arc::new(FeatureFlagRepo::new(cache.clone(), flag_seed).await?);
    let segments = Arc::new(SegmentRepo::new(cache.clone(), segment_seed).await?);
    let targets = Arc::new(TargetRepo::new(cache, target_seed).await?);

    let tokens = Arc::new(TokenRegistry::new());
    let (events_tx, _) = broadcast::channel(256);

    let stream_idle_timeout = config
        .heartbeat_interval()
        .map(|interval| interval * 2)
        .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT);

    let refresher = Refresher::new(
        upstream.clone(),
        flags.clone(),
        segments.clone(),
        targets.clone(),
        tokens.clone(),
        environments,
        events_tx.clone(),
        RefresherSettings {
            stream_enabled: config.flag_stream_enabled,
            poll_interval: config.flag_poll_interval(),
            poll_timeout: config.poll_timeout(),
            stream_idle_timeout,
        },
    );
    refresher.authenticate_upstream(&config.api_keys).await;

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (shutdown_tx, _) = broadcast::channel(1);

    tokio::spawn(refresher.clone().run(cmd_rx));
    if let Some(interval) = config.target_poll_duration() {
        tokio::spawn(
            refresher
                .clone()
                .run_target_poller(interval, shutdown_tx.subscribe()),
        );
    }

    let metric_service = MetricService::new(
        upstream.clone(),
        tokens,
        config.metric_post_duration().is_some(),
    );
    if let Some(interval) = config.metric_post_duration() {
        tokio::spawn(
            metric_service
                .clone()
                .run(interval, shutdown_tx.subscribe()),
        );
    }

    if let Some(interval) = config.heartbeat_interval() {
        let ping_upstream = upstream.clone();
        let _heartbeat = heartbeat::spawn(
            interval,
            move || {
                let upstream = ping_upstream.clone();
                async move { upstream.ping(UPSTREAM_PING_TIMEOUT).await.is_ok() }
            },
            shutdown_tx.subscribe(),
        );
    }

    let state = ApiState {
        auth: Arc::new(AuthService::new(
            auth_repo,
            &config.auth_secret,
            config.bypass_auth,
        )),
        flags,
        segments,
        targets,
        metrics: metric_service,
        events: events_tx,
        ready: Arc::new(AtomicBool::new(true)),
    };

    let listener =
        TcpListener::bind((config.listener.host.as_str(), config.listener.port)).await?;
    tracing::info!(
        host = %config.listener.host,
        port = config.listener.port,
        "relay listening"
    );

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // tear down the worker loops; each finishes its in-flight cleanup
    let _ = cmd_tx.send(Command::Shutdown).await;
    let _ = shutdown_tx.send(());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for shutdown signal");
    } else {
        tracing::info!("shutdown signal received");
    }
}
