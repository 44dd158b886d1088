//! String-keyed payload registry.

use foreman_core::Payload;
use std::collections::HashMap;
use std::sync::Arc;

/// Payload implementations keyed by the `type` a worker definition names.
///
/// One payload value serves every worker registered with its type.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    payloads: HashMap<String, Arc<dyn Payload>>,
}

impl PayloadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload under `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, payload: Arc<dyn Payload>) {
        self.payloads.insert(kind.into(), payload);
    }

    /// Builder-style [`Self::register`].
    pub fn with(mut self, kind: impl Into<String>, payload: Arc<dyn Payload>) -> Self {
        self.register(kind, payload);
        self
    }

    /// The payload registered under `kind`.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Payload>> {
        self.payloads.get(kind).map(Arc::clone)
    }

    /// Every registered type, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.payloads.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
