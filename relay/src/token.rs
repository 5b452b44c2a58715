use parking_lot::RwLock;
use std::collections::HashMap;

use crate::domain::EnvironmentId;

/// Process-wide map of per-environment upstream bearer tokens.
///
/// Written by the refresher when it (re)authenticates with upstream, read by
/// the metric service before each upload. A missing key is legitimate: the
/// environment simply has not authenticated yet.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<EnvironmentId, String>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, environment: EnvironmentId, token: String) {
        self.tokens.write().insert(environment, token);
    }

    pub fn get(&self, environment: &str) -> Option<String> {
        self.tokens.read().get(environment).cloned()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}
