//! Metrics definitions for the relay.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STREAM_EVENTS: MetricDef = MetricDef {
    name: "refresher.stream.events",
    metric_type: MetricType::Counter,
    description: "Change events received on the upstream stream, tagged by kind",
};

pub const STREAM_FAILOVERS: MetricDef = MetricDef {
    name: "refresher.stream.failovers",
    metric_type: MetricType::Counter,
    description: "Times the refresher fell back from streaming to polling",
};

pub const EVENTS_DROPPED: MetricDef = MetricDef {
    name: "refresher.events.dropped",
    metric_type: MetricType::Counter,
    description: "Stream events dropped after exhausting read-back retries",
};

pub const POLL_REFRESHES: MetricDef = MetricDef {
    name: "refresher.poll.refreshes",
    metric_type: MetricType::Counter,
    description: "Successful full refreshes of one environment",
};

pub const POLL_FAILURES: MetricDef = MetricDef {
    name: "refresher.poll.failures",
    metric_type: MetricType::Counter,
    description: "Environment polls that failed and kept the cached set",
};

pub const UNKNOWN_KEY_CACHE_HIT: MetricDef = MetricDef {
    name: "auth.unknown_key_cache.hit",
    metric_type: MetricType::Counter,
    description: "Authentication attempts short-circuited by the unknown-key cache",
};

pub const UNKNOWN_KEY_CACHE_MISS: MetricDef = MetricDef {
    name: "auth.unknown_key_cache.miss",
    metric_type: MetricType::Counter,
    description: "Authentication attempts that consulted the auth repository",
};

pub const FLUSH_ENVIRONMENTS: MetricDef = MetricDef {
    name: "metrics.flush.environments",
    metric_type: MetricType::Histogram,
    description: "Environments drained per metrics flush",
};

pub const FLUSH_FAILURES: MetricDef = MetricDef {
    name: "metrics.flush.failures",
    metric_type: MetricType::Counter,
    description: "Per-environment metric uploads that failed and were dropped",
};

pub const HEARTBEAT_TICKS: MetricDef = MetricDef {
    name: "heartbeat.ticks",
    metric_type: MetricType::Counter,
    description: "Heartbeat probes, tagged by result",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    STREAM_EVENTS,
    STREAM_FAILOVERS,
    EVENTS_DROPPED,
    POLL_REFRESHES,
    POLL_FAILURES,
    UNKNOWN_KEY_CACHE_HIT,
    UNKNOWN_KEY_CACHE_MISS,
    FLUSH_ENVIRONMENTS,
    FLUSH_FAILURES,
    HEARTBEAT_TICKS,
];
