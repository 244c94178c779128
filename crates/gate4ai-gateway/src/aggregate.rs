//! Generic fan-out over a session pool with deterministic collision
//! resolution.
//!
//! Every backend is fetched in parallel under its own timeout; a failing
//! backend is logged and dropped, never failing the aggregate. When the same
//! key appears in two or more backends, each occurrence is rewritten to
//! `{slug}:{original}`. All items are retained, none deduplicated.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};

use tracing::warn;

use crate::{
    ServiceError,
    config::Slug,
    model::{Prompt, Resource, ResourceTemplate, Tool},
    timeouts::Timeouts,
    upstream::UpstreamSession,
};

/// The `(key, slug)` capability of an aggregatable item: which field is the
/// gateway-visible identifier, and how to rewrite it.
pub trait GatewayItem: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;
    fn set_key(&mut self, key: String);
}

impl GatewayItem for Tool {
    fn key(&self) -> &str {
        &self.name
    }
    fn set_key(&mut self, key: String) {
        self.name = key.into();
    }
}

impl GatewayItem for Prompt {
    fn key(&self) -> &str {
        &self.name
    }
    fn set_key(&mut self, key: String) {
        self.name = key;
    }
}

impl GatewayItem for Resource {
    fn key(&self) -> &str {
        &self.uri
    }
    fn set_key(&mut self, key: String) {
        self.raw.uri = key;
    }
}

impl GatewayItem for ResourceTemplate {
    fn key(&self) -> &str {
        &self.uri_template
    }
    fn set_key(&mut self, key: String) {
        self.raw.uri_template = key;
    }
}

/// An aggregated item: the (possibly rewritten) schema item, the key the
/// owning backend knows it by, and that backend's slug. Only `item` is ever
/// serialized; the rest exists for reverse routing.
#[derive(Debug, Clone)]
pub struct Wrapped<T> {
    pub item: T,
    pub original_key: String,
    pub slug: Slug,
}

/// The gateway-visible spelling of a rewritten key.
pub fn prefixed(slug: &str, key: &str) -> String {
    format!("{slug}:{key}")
}

/// Fan out `fetch` over all sessions, collect per-backend results, and
/// resolve key collisions. Waits for each session's `open()` first; per
/// backend both the open outcome and a fetch timeout gate inclusion.
pub(crate) async fn fan_out<T, F, Fut>(
    sessions: &[Arc<UpstreamSession>],
    timeouts: &Timeouts,
    fetch: F,
) -> Vec<Wrapped<T>>
where
    T: GatewayItem,
    F: Fn(Arc<UpstreamSession>) -> Fut,
    Fut: Future<Output = Result<Arc<Vec<T>>, ServiceError>>,
{
    let fetches = sessions.iter().map(|session| {
        let session = session.clone();
        let fetch = &fetch;
        async move {
            let slug = session.slug().clone();
            if let Err(error) = session.open().await {
                warn!(slug = %slug, %error, "excluding backend from aggregate: open failed");
                return None;
            }
            match tokio::time::timeout(timeouts.list_fetch, fetch(session)).await {
                Ok(Ok(items)) => Some((slug, items)),
                Ok(Err(error)) => {
                    warn!(slug = %slug, %error, "excluding backend from aggregate: fetch failed");
                    None
                }
                Err(_) => {
                    warn!(slug = %slug, "excluding backend from aggregate: fetch timed out");
                    None
                }
            }
        }
    });
    let batches: Vec<(Slug, Arc<Vec<T>>)> = futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect();
    resolve_collisions(batches)
}

/// Rewrite every item whose key is claimed by two or more backends; items
/// with a unique key pass through unchanged.
pub(crate) fn resolve_collisions<T: GatewayItem>(batches: Vec<(Slug, Arc<Vec<T>>)>) -> Vec<Wrapped<T>> {
    let mut owners: HashMap<String, HashSet<Slug>> = HashMap::new();
    for (slug, items) in &batches {
        for item in items.iter() {
            owners
                .entry(item.key().to_string())
                .or_default()
                .insert(slug.clone());
        }
    }

    let mut wrapped = Vec::new();
    for (slug, items) in batches {
        for item in items.iter() {
            let original_key = item.key().to_string();
            let mut item = item.clone();
            let contested = owners
                .get(&original_key)
                .is_some_and(|slugs| slugs.len() >= 2);
            if contested {
                item.set_key(prefixed(&slug, &original_key));
            }
            wrapped.push(Wrapped {
                item,
                original_key,
                slug: slug.clone(),
            });
        }
    }
    wrapped
}
