//! Entities cached by the relay and the keyspace they live under.
//!
//! All cached state is scoped by an opaque environment identifier. The
//! keyspace is a flat string-keyed map; the key builders below are the only
//! place fingerprints are produced so they cannot drift between writers and
//! readers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type EnvironmentId = String;

/// Cache key for an environment's feature flag set.
pub fn feature_config_key(environment: &str) -> String {
    format!("env-{environment}-feature-config")
}

/// Cache key for an environment's segment set.
pub fn segment_key(environment: &str) -> String {
    format!("env-{environment}-segment")
}

/// Cache key for an environment's target set.
pub fn target_key(environment: &str) -> String {
    format!("env-{environment}-target-config")
}

/// Cache key for an API key to environment binding.
pub fn auth_key(api_key: &str) -> String {
    format!("auth-key-{api_key}")
}

/// Prefix shared by every auth binding key, used for scans.
pub const AUTH_KEY_PREFIX: &str = "auth-key-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagState {
    On,
    Off,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagKind {
    Boolean,
    String,
    Int,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: String,
}

/// A single condition inside a rule. The `segmentMatch` operator references
/// segment identifiers in `values`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub attribute: String,
    pub op: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub negate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Serve {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingRule {
    pub rule_id: String,
    pub priority: u32,
    pub clauses: Vec<Clause>,
    pub serve: Serve,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub identifier: String,
    pub kind: FlagKind,
    pub state: FlagState,
    pub variations: Vec<Variation>,
    pub default_serve: Serve,
    pub off_variation: String,
    #[serde(default)]
    pub rules: Vec<ServingRule>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub rules: Vec<Clause>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub segments: Vec<String>,
}

/// An API key bound to exactly one environment. An environment may have many
/// keys; a key never has more than one environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub api_key: String,
    pub environment: EnvironmentId,
}

/// JWT claims minted for SDK clients and carried by upstream tokens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub environment: EnvironmentId,
    pub iss: String,
    pub exp: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Target seen during evaluation, deduplicated by identifier on merge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// A single evaluation count; entries carry their own timestamp and are never
/// deduplicated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsData {
    pub timestamp: i64,
    pub count: i64,
    pub metrics_type: String,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// Body of `POST /metrics/<env>`, and the per-environment aggregate shape.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    #[serde(default)]
    pub target_data: Vec<TargetData>,
    #[serde(default)]
    pub metrics_data: Vec<MetricsData>,
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("could not encode cache entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("corrupt cache entry: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Tagged wrapper for everything that crosses the cache boundary.
///
/// The cache stores opaque bytes; this is the single encode/decode contract
/// for them. JSON is the current encoding but nothing outside this type may
/// depend on that.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CacheEntry {
    FeatureFlags(Vec<FeatureFlag>),
    Segments(Vec<Segment>),
    Targets(Vec<Target>),
    Environment(EnvironmentId),
}

impl CacheEntry {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<CacheEntry, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic_and_distinct() {
        assert_eq!(feature_config_key("abc"), "env-abc-feature-config");
        assert_eq!(segment_key("abc"), "env-abc-segment");
        assert_eq!(target_key("abc"), "env-abc-target-config");
        assert_eq!(auth_key("key-1"), "auth-key-key-1");

        let keys = [
            feature_config_key("abc"),
            segment_key("abc"),
            target_key("abc"),
            auth_key("abc"),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn cache_entry_round_trips() {
        let entries = vec![
            CacheEntry::FeatureFlags(vec![testdata::flag("dark-mode", 3)]),
            CacheEntry::Segments(vec![testdata::segment("beta-testers", 1)]),
            CacheEntry::Targets(vec![testdata::target("target-1")]),
            CacheEntry::Environment("env-1".to_string()),
        ];

        for entry in entries {
            let bytes = entry.encode().unwrap();
            assert_eq!(CacheEntry::decode(&bytes).unwrap(), entry);
        }
    }

    #[test]
    fn empty_sets_round_trip() {
        let entry = CacheEntry::FeatureFlags(vec![]);
        let bytes = entry.encode().unwrap();
        assert_eq!(CacheEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            CacheEntry::decode(b"not json"),
            Err(CodecError::Decode(_))
        ));
    }
}
