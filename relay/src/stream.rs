//! Consumer for the upstream server-push stream.
//!
//! The transport is server-sent events; this module only cares about the
//! `event:`/`data:` frames and turns them into typed change events. Reads
//! are bounded by an idle timeout supplied by the caller; a stream that
//! goes silent past it is treated as failed so the refresher can fall back
//! to polling.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use crate::domain::EnvironmentId;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("stream handshake failed: {0}")]
    Handshake(StatusCode),
    #[error("stream closed by upstream")]
    Closed,
    #[error("no event or heartbeat within {0:?}")]
    Silent(Duration),
    #[error("stream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Flag,
    Segment,
    Target,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A single upstream mutation: enough to locate the entity, not to apply it.
/// The payload may be stale by the time we read it, so appliers must fetch
/// the canonical entity back from upstream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub environment: EnvironmentId,
    pub entity: EntityKind,
    pub change: ChangeKind,
    pub identifier: String,
    pub version: u64,
}

impl ChangeEvent {
    /// Wire name of the event, e.g. `flag_updated`.
    pub fn kind_name(&self) -> &'static str {
        match (self.entity, self.change) {
            (EntityKind::Flag, ChangeKind::Created) => "flag_created",
            (EntityKind::Flag, ChangeKind::Updated) => "flag_updated",
            (EntityKind::Flag, ChangeKind::Deleted) => "flag_deleted",
            (EntityKind::Segment, ChangeKind::Created) => "segment_created",
            (EntityKind::Segment, ChangeKind::Updated) => "segment_updated",
            (EntityKind::Segment, ChangeKind::Deleted) => "segment_deleted",
            (EntityKind::Target, ChangeKind::Created) => "target_created",
            (EntityKind::Target, ChangeKind::Updated) => "target_updated",
            (EntityKind::Target, ChangeKind::Deleted) => "target_deleted",
        }
    }
}

fn parse_kind(name: &str) -> Option<(EntityKind, ChangeKind)> {
    let (entity, change) = name.split_once('_')?;
    let entity = match entity {
        "flag" => EntityKind::Flag,
        "segment" => EntityKind::Segment,
        "target" => EntityKind::Target,
        _ => return None,
    };
    let change = match change {
        "created" => ChangeKind::Created,
        "updated" => ChangeKind::Updated,
        "deleted" => ChangeKind::Deleted,
        _ => return None,
    };
    Some((entity, change))
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage {
    Change(ChangeEvent),
    Heartbeat,
}

#[derive(Deserialize)]
struct ChangePayload {
    environment: EnvironmentId,
    identifier: String,
    #[serde(default)]
    version: u64,
}

/// Incremental SSE frame parser. Frames are separated by a blank line; only
/// `event:` and `data:` fields are consumed, everything else (comments,
/// `id:`, `retry:`) is skipped.
#[derive(Default)]
pub struct FrameParser {
    buf: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamMessage> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut messages = Vec::new();
        while let Some(end) = self.buf.find("\n\n") {
            let frame: String = self.buf.drain(..end + 2).collect();
            if let Some(message) = parse_frame(&frame) {
                messages.push(message);
            }
        }
        messages
    }
}

fn parse_frame(frame: &str) -> Option<StreamMessage> {
    let mut event_name = None;
    let mut data = String::new();

    for line in frame.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event_name = Some(name.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim());
        }
    }

    let name = event_name?;
    if name == "heartbeat" {
        return Some(StreamMessage::Heartbeat);
    }

    let Some((entity, change)) = parse_kind(&name) else {
        tracing::debug!(event = %name, "skipping unknown stream event");
        return None;
    };

    match serde_json::from_str::<ChangePayload>(&data) {
        Ok(payload) => Some(StreamMessage::Change(ChangeEvent {
            environment: payload.environment,
            entity,
            change,
            identifier: payload.identifier,
            version: payload.version,
        })),
        Err(e) => {
            tracing::warn!(event = %name, error = %e, "dropping malformed stream event");
            None
        }
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

pub struct StreamConnection {
    chunks: ChunkStream,
    parser: FrameParser,
    pending: VecDeque<StreamMessage>,
}

impl StreamConnection {
    /// Opens the long-lived `/stream` connection. The handshake must succeed
    /// before this returns; a non-2xx response fails fast so the caller can
    /// fall back to polling.
    pub async fn connect(client_url: &str, token: &str) -> Result<Self, StreamError> {
        let response = reqwest::Client::new()
            .get(format!("{}/stream", client_url.trim_end_matches('/')))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StreamError::Handshake(response.status()));
        }

        Ok(Self::from_chunks(Box::pin(
            response.bytes_stream().map(|r| r.map_err(StreamError::from)),
        )))
    }

    fn from_chunks(chunks: ChunkStream) -> Self {
        Self {
            chunks,
            parser: FrameParser::new(),
            pending: VecDeque::new(),
        }
    }

    /// Returns the next message, failing if the stream stays silent for
    /// `idle_timeout`.
    pub async fn next(&mut self, idle_timeout: Duration) -> Result<StreamMessage, StreamError> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(message);
            }

            let chunk = tokio::time::timeout(idle_timeout, self.chunks.next())
                .await
                .map_err(|_| StreamError::Silent(idle_timeout))?;

            match chunk {
                Some(Ok(bytes)) => self.pending.extend(self.parser.push(&bytes)),
                Some(Err(e)) => return Err(e),
                None => return Err(StreamError::Closed),
            }
        }
    }
}
