//! Outbound header composition for upstream sessions.
//!
//! Three layers merge into one set, later layers overriding earlier ones:
//! subscription headers (per user+backend), then server headers (per
//! backend), then system headers. Keys compare case-insensitively and are
//! stored lower-cased. A session composes its set once at construction; the
//! set is applied to every request of that session unchanged.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use http::header::{HeaderName, HeaderValue};
use tracing::warn;

use crate::config::{ConfigError, ConfigSource, HeaderTemplate};

pub const USER_ID_HEADER: &str = "gate4ai-user-id";
pub const SERVER_SLUG_HEADER: &str = "gate4ai-server-slug";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// The merged header set of one upstream session. Keys are lower-case;
/// iteration order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedHeaders {
    entries: BTreeMap<String, String>,
}

impl ComposedHeaders {
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Attach the set to an outbound request. Names or values the HTTP layer
    /// rejects are skipped with a warning rather than failing the request.
    pub fn apply(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.entries {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    builder = builder.header(name, value);
                }
                _ => warn!(header = %name, "skipping header rejected by the HTTP layer"),
            }
        }
        builder
    }

    fn merge(&mut self, template: HeaderTemplate) {
        for (name, value) in template {
            self.insert(&name, value);
        }
    }
}

/// Composes the outbound header set for one `(user, backend)` pair.
pub struct HeaderComposer {
    config: Arc<dyn ConfigSource>,
}

impl HeaderComposer {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self { config }
    }

    /// Merge order: subscription < server < system. A `NotFound` template is
    /// an empty layer; other store errors degrade the same way but are
    /// logged.
    pub async fn compose(
        &self,
        user_id: Option<&str>,
        slug: &str,
        peer_addr: Option<SocketAddr>,
        incoming_forwarded_for: Option<&str>,
    ) -> ComposedHeaders {
        let mut headers = ComposedHeaders::default();

        if let Some(user_id) = user_id {
            let layer = self.config.subscription_headers(user_id, slug).await;
            Self::merge_layer(&mut headers, layer, "subscription");
        }
        let layer = self.config.server_headers(slug).await;
        Self::merge_layer(&mut headers, layer, "server");

        if let Some(user_id) = user_id {
            headers.insert(USER_ID_HEADER, user_id);
        }
        headers.insert(SERVER_SLUG_HEADER, slug);
        if let Some(forwarded) = forwarded_for(incoming_forwarded_for, peer_addr) {
            headers.insert(FORWARDED_FOR_HEADER, forwarded);
        }

        headers
    }

    fn merge_layer(
        headers: &mut ComposedHeaders,
        layer: Result<HeaderTemplate, ConfigError>,
        kind: &str,
    ) {
        match layer {
            Ok(template) => headers.merge(template),
            Err(error) if error.is_not_found() => {}
            Err(error) => warn!(kind, %error, "failed to load header template"),
        }
    }
}

/// Existing `X-Forwarded-For` value plus the peer address, comma-joined.
fn forwarded_for(incoming: Option<&str>, peer: Option<SocketAddr>) -> Option<String> {
    match (incoming, peer) {
        (Some(incoming), Some(peer)) => Some(format!("{}, {}", incoming, peer.ip())),
        (Some(incoming), None) => Some(incoming.to_string()),
        (None, Some(peer)) => Some(peer.ip().to_string()),
        (None, None) => None,
    }
}
