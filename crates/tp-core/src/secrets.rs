//! Key-fetch interface over the external secrets store.
//!
//! The orchestrator never persists credentials itself; it asks a
//! [`SecretStore`] for the handful of keys it needs and passes them on
//! (env injection for CLI children, bearer tokens for forge clients).

use async_trait::async_trait;

/// Secret keys recognized by the orchestrator core.
pub const AI_API_KEY: &str = "ai_api_key";
pub const GITHUB_TOKEN: &str = "github_token";
pub const GITLAB_TOKEN: &str = "gitlab_token";

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by key. `None` when the key is unset.
    async fn get(&self, key: &str) -> Option<String>;
}

/// Environment-variable-backed store: `ai_api_key` -> `AI_API_KEY`, etc.
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, key: &str) -> Option<String> {
        let var = key.to_uppercase();
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

/// Fixed in-memory store, useful for tests and embedding.
#[derive(Default)]
pub struct StaticSecretStore {
    entries: std::collections::HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}
