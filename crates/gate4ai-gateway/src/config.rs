//! Collaborator interface to the configuration store, plus an in-memory
//! implementation used by tests and small embedders. The real portal-backed
//! store lives outside this crate.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// Stable short identifier of a backend, used as the prefix in rewritten
/// names and URIs.
pub type Slug = Arc<str>;

/// A header template from the store: name → value, casing as stored.
pub type HeaderTemplate = HashMap<String, String>;

/// Configuration descriptor of one upstream MCP server.
#[derive(Debug, Clone)]
pub struct Backend {
    pub slug: Slug,
    /// Base URL of the SSE endpoint.
    pub url: Url,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sentinel: the requested entity does not exist. Callers treat this
    /// differently from a broken store.
    #[error("not found")]
    NotFound,
    #[error("invalid backend url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("config store error: {0}")]
    Store(String),
}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::NotFound)
    }
}

/// What the core needs from the configuration store.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn backend(&self, slug: &str) -> Result<Backend, ConfigError>;
    /// Slugs of the backends the user is currently subscribed to.
    async fn user_subscriptions(&self, user_id: &str) -> Result<Vec<Slug>, ConfigError>;
    async fn server_headers(&self, slug: &str) -> Result<HeaderTemplate, ConfigError>;
    async fn subscription_headers(
        &self,
        user_id: &str,
        slug: &str,
    ) -> Result<HeaderTemplate, ConfigError>;
}

/// Hash-map backed [`ConfigSource`]. Mutable at runtime so tests can change a
/// user's subscription set between TTL windows.
#[derive(Default)]
pub struct MemoryConfig {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    backends: HashMap<String, Backend>,
    subscriptions: HashMap<String, Vec<Slug>>,
    server_headers: HashMap<String, HeaderTemplate>,
    subscription_headers: HashMap<(String, String), HeaderTemplate>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_backend(&self, slug: &str, url: &str) -> Result<(), ConfigError> {
        let url = Url::parse(url)?;
        let backend = Backend {
            slug: slug.into(),
            url,
        };
        self.write().backends.insert(slug.to_string(), backend);
        Ok(())
    }

    pub fn subscribe(&self, user_id: &str, slug: &str) {
        let mut inner = self.write();
        let slugs = inner.subscriptions.entry(user_id.to_string()).or_default();
        if !slugs.iter().any(|s| s.as_ref() == slug) {
            slugs.push(slug.into());
        }
    }

    pub fn unsubscribe(&self, user_id: &str, slug: &str) {
        let mut inner = self.write();
        if let Some(slugs) = inner.subscriptions.get_mut(user_id) {
            slugs.retain(|s| s.as_ref() != slug);
        }
    }

    pub fn set_server_headers(&self, slug: &str, headers: HeaderTemplate) {
        self.write().server_headers.insert(slug.to_string(), headers);
    }

    pub fn set_subscription_headers(&self, user_id: &str, slug: &str, headers: HeaderTemplate) {
        self.write()
            .subscription_headers
            .insert((user_id.to_string(), slug.to_string()), headers);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().expect("config lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().expect("config lock poisoned")
    }
}

#[async_trait]
impl ConfigSource for MemoryConfig {
    async fn backend(&self, slug: &str) -> Result<Backend, ConfigError> {
        self.read()
            .backends
            .get(slug)
            .cloned()
            .ok_or(ConfigError::NotFound)
    }

    async fn user_subscriptions(&self, user_id: &str) -> Result<Vec<Slug>, ConfigError> {
        Ok(self
            .read()
            .subscriptions
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn server_headers(&self, slug: &str) -> Result<HeaderTemplate, ConfigError> {
        self.read()
            .server_headers
            .get(slug)
            .cloned()
            .ok_or(ConfigError::NotFound)
    }

    async fn subscription_headers(
        &self,
        user_id: &str,
        slug: &str,
    ) -> Result<HeaderTemplate, ConfigError> {
        self.read()
            .subscription_headers
            .get(&(user_id.to_string(), slug.to_string()))
            .cloned()
            .ok_or(ConfigError::NotFound)
    }
}
