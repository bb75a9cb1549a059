// Clawdbot Gateway — Runtime Backend Registry
//
// Backends register under their `kind`; selection is by config
// (`runtime_kind`). The provider backends themselves live outside the
// core — they only have to satisfy the AgentRuntime contract.

use super::AgentRuntime;
use crate::atoms::error::{GatewayError, GatewayResult};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default)]
pub struct RuntimeRegistry {
    backends: BTreeMap<String, Arc<dyn AgentRuntime>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        RuntimeRegistry::default()
    }

    pub fn register(&mut self, runtime: Arc<dyn AgentRuntime>) {
        self.backends.insert(runtime.kind().to_string(), runtime);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn AgentRuntime>> {
        self.backends.get(kind).cloned()
    }

    /// Resolve the configured backend or fail with the list of known
    /// kinds.
    pub fn select(&self, kind: &str) -> GatewayResult<Arc<dyn AgentRuntime>> {
        self.get(kind).ok_or_else(|| {
            GatewayError::Config(format!(
                "No runtime backend registered for kind {:?} (known: {})",
                kind,
                self.backends.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    pub fn kinds(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}
