//! The subscription bridge.
//!
//! Downstream subscribe/unsubscribe requests are resolved through the cached
//! resource list to the owning backend and forwarded with the backend's own
//! URI. Inbound `resources/updated` notifications travel the other way: the
//! registry yields the originating downstream session, the cached list
//! recovers the gateway-visible URI, and the notification is re-emitted in
//! the downstream namespace. When no mapping exists (cache expired, or the
//! resource vanished from the list) the prefixed `{slug}:{uri}` form is
//! emitted instead, with a warning.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    aggregate::prefixed,
    config::Slug,
    downstream::SessionState,
    model::{
        ErrorData, NOTIFICATION_PROMPTS_LIST_CHANGED, NOTIFICATION_RESOURCES_LIST_CHANGED,
        NOTIFICATION_RESOURCES_UPDATED, SubscribeRequestParam, UnsubscribeRequestParam,
    },
    upstream::ChangedList,
};

use super::{Gateway, GatewayShared};

impl Gateway {
    /// The subscription set lock is held across the upstream forward, so two
    /// concurrent subscribes to the same URI produce exactly one upstream
    /// subscribe.
    pub(crate) async fn subscribe(
        &self,
        state: &Arc<SessionState>,
        params: SubscribeRequestParam,
        ct: &CancellationToken,
    ) -> Result<Value, ErrorData> {
        let wrapped = self.wrapped_resources(state).await?;
        let entry = wrapped
            .iter()
            .find(|w| w.item.uri == params.uri)
            .ok_or_else(|| {
                ErrorData::resource_not_found(format!("resource not found: '{}'", params.uri))
            })?;

        let mut subscriptions = state.subscriptions.lock().await;
        if subscriptions.contains(&params.uri) {
            return Ok(json!({ "uri": params.uri }));
        }
        let session = self.backend_session(state, &entry.slug).await?;
        session
            .subscribe_resource(entry.original_key.clone(), ct)
            .await
            .map_err(|error| {
                ErrorData::internal_error(format!(
                    "backend error subscribing to '{}': {error}",
                    params.uri
                ))
            })?;
        subscriptions.insert(params.uri.clone());
        Ok(json!({ "uri": params.uri }))
    }

    pub(crate) async fn unsubscribe(
        &self,
        state: &Arc<SessionState>,
        params: UnsubscribeRequestParam,
        ct: &CancellationToken,
    ) -> Result<Value, ErrorData> {
        let mut subscriptions = state.subscriptions.lock().await;
        if !subscriptions.contains(&params.uri) {
            return Ok(json!({ "uri": params.uri }));
        }

        let wrapped = self.wrapped_resources(state).await?;
        match wrapped.iter().find(|w| w.item.uri == params.uri) {
            Some(entry) => {
                let session = self.backend_session(state, &entry.slug).await?;
                session
                    .unsubscribe_resource(entry.original_key.clone(), ct)
                    .await
                    .map_err(|error| {
                        ErrorData::internal_error(format!(
                            "backend error unsubscribing from '{}': {error}",
                            params.uri
                        ))
                    })?;
            }
            None => {
                // the resource fell out of the backend's list; nothing left
                // to tell the upstream
                warn!(uri = %params.uri, "unsubscribing a resource with no known owner");
            }
        }
        subscriptions.remove(&params.uri);
        Ok(json!({ "uri": params.uri }))
    }
}

/// Route an upstream `resources/updated` back to the originating downstream
/// session, translating into the gateway-visible namespace. Runs on the
/// upstream read task: the mapping lookup is lock-only, the delivery itself
/// is spawned.
pub(crate) fn route_resource_updated(
    shared: &Arc<GatewayShared>,
    downstream_id: &Arc<str>,
    slug: &Slug,
    uri: &str,
) {
    let Some(state) = shared.registry.get(downstream_id) else {
        debug!(session = %downstream_id, "dropping resource update: downstream session gone");
        return;
    };
    let mapped = state.resources.get().and_then(|wrapped| {
        wrapped
            .iter()
            .find(|w| w.original_key == uri && &w.slug == slug)
            .map(|w| w.item.uri.clone())
    });
    let gateway_uri = match mapped {
        Some(uri) => uri,
        None => {
            warn!(slug = %slug, uri, "no cached mapping for updated resource, using prefixed URI");
            prefixed(slug, uri)
        }
    };
    let Some(session) = state.session.upgrade() else {
        debug!(session = %downstream_id, "dropping resource update: downstream session gone");
        return;
    };
    tokio::spawn(async move {
        if let Err(error) = session
            .send_notification(NOTIFICATION_RESOURCES_UPDATED, json!({ "uri": gateway_uri }))
            .await
        {
            warn!(%error, "failed to deliver resource update downstream");
        }
    });
}

/// Invalidate the affected downstream list cache and forward the
/// list-changed notification, per the announced capabilities.
pub(crate) fn route_list_changed(
    shared: &Arc<GatewayShared>,
    downstream_id: &Arc<str>,
    kind: ChangedList,
) {
    let Some(state) = shared.registry.get(downstream_id) else {
        debug!(session = %downstream_id, "dropping list change: downstream session gone");
        return;
    };
    let method = match kind {
        ChangedList::Prompts => {
            state.prompts.invalidate();
            NOTIFICATION_PROMPTS_LIST_CHANGED
        }
        ChangedList::Resources => {
            state.resources.invalidate();
            NOTIFICATION_RESOURCES_LIST_CHANGED
        }
    };
    let Some(session) = state.session.upgrade() else {
        debug!(session = %downstream_id, "dropping list change: downstream session gone");
        return;
    };
    tokio::spawn(async move {
        if let Err(error) = session.send_notification(method, Value::Null).await {
            warn!(%error, "failed to deliver list change downstream");
        }
    });
}
