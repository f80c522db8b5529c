//! Client facade: one validated configuration for producers and consumers.

use crate::config::ClientConfig;
use crate::consumer::Consumer;
use crate::error::Result;
use crate::producer::Producer;
use std::path::Path;
use std::sync::Arc;

/// Entry point holding the validated configuration. Each producer or
/// consumer it creates owns its own connections.
#[derive(Debug, Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
}

impl Client {
    /// Fails with `Config` on an empty endpoint list, a malformed endpoint
    /// or a non-positive timeout.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(ClientConfig::from_json_file(path)?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a producer. Must be called within a tokio runtime.
    pub fn producer(&self) -> Producer {
        Producer::with_config(Arc::clone(&self.config))
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::with_config(Arc::clone(&self.config))
    }
}
