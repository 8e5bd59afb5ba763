//! Provider router — resolves which model backend serves a request.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use nexus_common::EngineError;

use crate::ModelBackend;

/// Which model provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Gemini,
    OpenAiCompatible,
}

/// Routes requests to registered backends, with a configured default.
pub struct BackendRouter {
    backends: HashMap<Provider, Arc<dyn ModelBackend>>,
    default_provider: Provider,
}

impl BackendRouter {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_provider: Provider::Gemini,
        }
    }

    pub fn register(&mut self, provider: Provider, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(provider, backend);
    }

    pub fn set_default(&mut self, provider: Provider) {
        self.default_provider = provider;
    }

    pub fn default_provider(&self) -> Provider {
        self.default_provider
    }

    /// Resolve a backend: an explicit provider wins, otherwise the
    /// default applies. An unregistered provider is a configuration
    /// error.
    pub fn resolve(&self, provider: Option<Provider>) -> Result<Arc<dyn ModelBackend>, EngineError> {
        let provider = provider.unwrap_or(self.default_provider);
        self.backends
            .get(&provider)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no backend registered for {provider:?}")))
    }
}

impl Default for BackendRouter {
    fn default() -> Self {
        Self::new()
    }
}
