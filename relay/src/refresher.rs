//! Keeps the cache aligned with upstream.
//!
//! Two transports feed the repositories: the push stream (preferred) and a
//! full-refresh poll (fallback). Arbitration between them is the state
//! machine below; transitions are driven by handshake results, idle
//! timeouts, and shutdown.
//!
//! | State     | On                                   | Next      |
//! |-----------|--------------------------------------|-----------|
//! | INIT      | seed complete                        | STREAMING (if enabled) or POLLING |
//! | STREAMING | stream error / silence past 2×hb     | POLLING   |
//! | STREAMING | shutdown                             | STOPPED   |
//! | POLLING   | stream reconnect succeeds            | STREAMING |
//! | POLLING   | shutdown                             | STOPPED   |

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use shared::counter;

use crate::auth;
use crate::domain::EnvironmentId;
use crate::metrics_defs::{
    EVENTS_DROPPED, POLL_FAILURES, POLL_REFRESHES, STREAM_EVENTS, STREAM_FAILOVERS,
};
use crate::repository::{FeatureFlagRepo, RepoError, SegmentRepo, TargetRepo};
use crate::stream::{
    ChangeEvent, ChangeKind, EntityKind, StreamConnection, StreamError, StreamMessage,
};
use crate::token::TokenRegistry;
use crate::upstream::{with_backoff, UpstreamClient, UpstreamError};

const EVENT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const TARGET_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    Streaming,
    Polling,
    Stopped,
}

#[derive(Debug)]
pub enum Command {
    /// Trigger a full refresh ahead of schedule. Acked when the refresh
    /// attempt finishes.
    Refresh(oneshot::Sender<()>),
    Shutdown,
}

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Clone, Debug)]
pub struct RefresherSettings {
    pub stream_enabled: bool,
    pub poll_interval: Duration,
    /// Per-request deadline for poll fetches.
    pub poll_timeout: Duration,
    /// How long the stream may stay silent before it is considered failed.
    pub stream_idle_timeout: Duration,
}

enum Session {
    /// Enter STREAMING, reusing an already-open connection if present.
    Stream(Option<StreamConnection>),
    Poll,
    Stop,
}

#[derive(Clone)]
pub struct Refresher {
    upstream: Arc<UpstreamClient>,
    flags: Arc<FeatureFlagRepo>,
    segments: Arc<SegmentRepo>,
    targets: Arc<TargetRepo>,
    tokens: Arc<TokenRegistry>,
    environments: Arc<Vec<EnvironmentId>>,
    events: broadcast::Sender<ChangeEvent>,
    settings: RefresherSettings,
    state: Arc<RwLock<State>>,
}

impl Refresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Arc<UpstreamClient>,
        flags: Arc<FeatureFlagRepo>,
        segments: Arc<SegmentRepo>,
        targets: Arc<TargetRepo>,
        tokens: Arc<TokenRegistry>,
        environments: Vec<EnvironmentId>,
        events: broadcast::Sender<ChangeEvent>,
        settings: RefresherSettings,
    ) -> Self {
        Self {
            upstream,
            flags,
            segments,
            targets,
            tokens,
            environments: Arc::new(environments),
            events,
            settings,
            state: Arc::new(RwLock::new(State::Init)),
        }
    }

    pub fn state(&self) -> State {
        *self.state.read()
    }

    fn set_state(&self, next: State) {
        let mut state = self.state.write();
        if *state != next {
            tracing::info!(from = ?*state, to = ?next, "refresher state change");
            *state = next;
        }
    }

    /// Exchanges each configured SDK key for an upstream bearer token and
    /// records it against the key's environment for the metric uploads.
    pub async fn authenticate_upstream(&self, api_keys: &[String]) {
        for api_key in api_keys {
            let token = match with_backoff("authenticate api key", || {
                self.upstream.authenticate(api_key)
            })
            .await
            {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!(error = %e, "could not authenticate api key with upstream");
                    continue;
                }
            };

            match auth::environment_from_token(&token) {
                Ok(environment) => {
                    tracing::debug!(environment = %environment, "stored upstream token");
                    self.tokens.put(environment, token);
                }
                Err(_) => tracing::warn!("upstream token carries no environment claim"),
            }
        }
    }

    /// Main worker loop; runs until shutdown.
    pub async fn run(self, mut rx: mpsc::Receiver<Command>) {
        let mut session = if self.settings.stream_enabled {
            Session::Stream(None)
        } else {
            Session::Poll
        };

        loop {
            session = match session {
                Session::Stream(conn) => self.stream_session(conn, &mut rx).await,
                Session::Poll => self.poll_session(&mut rx).await,
                Session::Stop => break,
            };
        }
        self.set_state(State::Stopped);
        tracing::info!("refresher stopped");
    }

    async fn connect_stream(&self) -> Result<StreamConnection, StreamError> {
        StreamConnection::connect(self.upstream.client_url(), self.upstream.admin_token()).await
    }

    async fn stream_session(
        &self,
        conn: Option<StreamConnection>,
        rx: &mut mpsc::Receiver<Command>,
    ) -> Session {
        let mut conn = match conn {
            Some(conn) => conn,
            None => match self.connect_stream().await {
                Ok(conn) => conn,
                Err(e) => {
                    counter!(STREAM_FAILOVERS).increment(1);
                    tracing::warn!(error = %e, "stream handshake failed, falling back to polling");
                    return Session::Poll;
                }
            },
        };
        self.set_state(State::Streaming);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh(ack)) => {
                        self.poll_all().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown) | None => return Session::Stop,
                },
                message = conn.next(self.settings.stream_idle_timeout) => match message {
                    Ok(StreamMessage::Heartbeat) => {}
                    Ok(StreamMessage::Change(event)) => self.apply_event(event).await,
                    Err(e) => {
                        counter!(STREAM_FAILOVERS).increment(1);
                        tracing::warn!(error = %e, "stream failed, falling back to polling");
                        return Session::Poll;
                    }
                },
            }
        }
    }

    async fn poll_session(&self, rx: &mut mpsc::Receiver<Command>) -> Session {
        self.set_state(State::Polling);
        // poll fires immediately on entering POLLING
        self.poll_all().await;

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate tick; we just polled

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Refresh(ack)) => {
                        self.poll_all().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown) | None => return Session::Stop,
                },
                _ = ticker.tick() => {
                    if self.settings.stream_enabled {
                        match self.connect_stream().await {
                            Ok(conn) => {
                                tracing::info!("stream reconnected");
                                return Session::Stream(Some(conn));
                            }
                            Err(e) => tracing::debug!(error = %e, "stream reconnect failed"),
                        }
                    }
                    self.poll_all().await;
                }
            }
        }
    }

    /// Full refresh of every environment. Failures keep the previous cached
    /// set authoritative; the next tick proceeds normally.
    pub async fn poll_all(&self) {
        for environment in self.environments.iter() {
            match self.poll_environment(environment).await {
                Ok(()) => counter!(POLL_REFRESHES).increment(1),
                Err(e) => {
                    counter!(POLL_FAILURES).increment(1);
                    tracing::warn!(environment = %environment, error = %e, "poll failed, keeping cached set");
                }
            }
        }
    }

    async fn poll_environment(&self, environment: &str) -> Result<(), RefreshError> {
        let timeout = self.settings.poll_timeout;
        let flags = self.upstream.feature_configs(environment, timeout).await?;
        let segments = self.upstream.segments(environment, timeout).await?;
        let targets = self.upstream.targets(environment, timeout).await?;

        self.flags.setup(environment, flags).await?;
        self.segments.setup(environment, segments).await?;
        self.targets.setup(environment, targets).await?;
        Ok(())
    }

    /// Independent loop refreshing targets only; they change too often to
    /// ride the flag cadence.
    pub async fn run_target_poller(
        self,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // targets were just seeded

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("target poll loop stopping");
                    return;
                }
                _ = ticker.tick() => self.poll_targets().await,
            }
        }
    }

    async fn poll_targets(&self) {
        for environment in self.environments.iter() {
            let refreshed: Result<(), RefreshError> = async {
                let targets = self
                    .upstream
                    .targets(environment, TARGET_POLL_TIMEOUT)
                    .await?;
                self.targets.setup(environment, targets).await?;
                Ok(())
            }
            .await;

            if let Err(e) = refreshed {
                tracing::warn!(environment = %environment, error = %e, "target poll failed");
            }
        }
    }

    /// Applies one stream event and rebroadcasts it to connected SDKs.
    /// Exhausted retries drop the event; the next poll or event repairs the
    /// entry.
    pub async fn apply_event(&self, event: ChangeEvent) {
        counter!(STREAM_EVENTS, "kind" => event.kind_name()).increment(1);

        match self.apply_change(&event).await {
            Ok(true) => {
                let _ = self.events.send(event);
            }
            Ok(false) => {}
            Err(e) => {
                counter!(EVENTS_DROPPED).increment(1);
                tracing::warn!(
                    environment = %event.environment,
                    identifier = %event.identifier,
                    kind = event.kind_name(),
                    error = %e,
                    "dropping stream event"
                );
            }
        }
    }

    /// The event payload may be stale, so creates and updates read the
    /// canonical entity back from upstream before writing. A fetched
    /// version below the cached one is discarded; deletions always win.
    async fn apply_change(&self, event: &ChangeEvent) -> Result<bool, RefreshError> {
        match (event.entity, event.change) {
            (EntityKind::Flag, ChangeKind::Deleted) => {
                self.flags
                    .remove(&event.environment, &event.identifier)
                    .await?;
                Ok(true)
            }
            (EntityKind::Flag, _) => {
                let flag = with_backoff("fetch feature flag", || {
                    self.upstream.feature_config(
                        &event.environment,
                        &event.identifier,
                        EVENT_FETCH_TIMEOUT,
                    )
                })
                .await?;

                if let Ok(current) = self.flags.get(&event.environment, &event.identifier).await {
                    if flag.version < current.version {
                        tracing::debug!(
                            identifier = %event.identifier,
                            fetched = flag.version,
                            cached = current.version,
                            "discarding stale flag fetch"
                        );
                        return Ok(false);
                    }
                }
                self.flags.add(&event.environment, vec![flag]).await?;
                Ok(true)
            }
            (EntityKind::Segment, ChangeKind::Deleted) => {
                self.segments
                    .remove(&event.environment, &event.identifier)
                    .await?;
                Ok(true)
            }
            (EntityKind::Segment, _) => {
                let segment = with_backoff("fetch segment", || {
                    self.upstream
                        .segment(&event.environment, &event.identifier, EVENT_FETCH_TIMEOUT)
                })
                .await?;

                if let Ok(current) = self
                    .segments
                    .get(&event.environment, &event.identifier)
                    .await
                {
                    if segment.version < current.version {
                        tracing::debug!(
                            identifier = %event.identifier,
                            fetched = segment.version,
                            cached = current.version,
                            "discarding stale segment fetch"
                        );
                        return Ok(false);
                    }
                }
                self.segments.add(&event.environment, vec![segment]).await?;
                Ok(true)
            }
            (EntityKind::Target, ChangeKind::Deleted) => {
                self.targets
                    .remove(&event.environment, &event.identifier)
                    .await?;
                Ok(true)
            }
            (EntityKind::Target, _) => {
                // targets carry no version, so the last fetch wins
                let target = with_backoff("fetch target", || {
                    self.upstream
                        .target(&event.environment, &event.identifier, EVENT_FETCH_TIMEOUT)
                })
                .await?;
                self.targets.add(&event.environment, vec![target]).await?;
                Ok(true)
            }
        }
    }
}
