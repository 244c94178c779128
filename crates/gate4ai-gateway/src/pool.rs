//! Per-downstream-client collection of upstream sessions, reconciled lazily
//! against the user's current subscription set.

use std::{collections::HashMap, sync::Arc, sync::Weak, time::Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::{ConfigError, Slug},
    downstream::DownstreamSession,
    gateway::{GatewayShared, subscriptions},
    headers::HeaderComposer,
    upstream::{SessionStatus, UpstreamSession},
};

#[derive(Debug, Error)]
pub(crate) enum PoolError {
    #[error("downstream session is gone")]
    SessionGone,
    #[error("failed to load subscriptions: {0}")]
    Subscriptions(#[from] ConfigError),
}

struct PoolState {
    sessions: HashMap<Slug, Arc<UpstreamSession>>,
    refreshed_at: Option<Instant>,
}

/// Maps backend slug → upstream session for one downstream client. At most
/// one session exists per slug at any instant.
pub(crate) struct SessionPool {
    downstream: Weak<dyn DownstreamSession>,
    shared: Arc<GatewayShared>,
    state: tokio::sync::Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(downstream: Weak<dyn DownstreamSession>, shared: Arc<GatewayShared>) -> Self {
        Self {
            downstream,
            shared,
            state: tokio::sync::Mutex::new(PoolState {
                sessions: HashMap::new(),
                refreshed_at: None,
            }),
        }
    }

    /// All live sessions. Within the TTL the cached pool answers; past it the
    /// pool reconciles: new slugs are constructed and opened concurrently,
    /// removed slugs are closed, failures are logged and excluded until the
    /// next expiry.
    pub async fn sessions(&self) -> Result<Vec<Arc<UpstreamSession>>, PoolError> {
        let mut state = self.state.lock().await;
        let fresh = state
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.shared.timeouts.cache_ttl);
        if !fresh {
            self.reconcile(&mut state).await?;
        }
        Ok(state
            .sessions
            .values()
            .filter(|session| session.status() != SessionStatus::Closed)
            .cloned()
            .collect())
    }

    pub async fn by_slug(&self, slug: &str) -> Result<Option<Arc<UpstreamSession>>, PoolError> {
        let sessions = self.sessions().await?;
        Ok(sessions
            .into_iter()
            .find(|session| session.slug().as_ref() == slug))
    }

    /// Close every session and forget the pool contents.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        for session in state.sessions.values() {
            session.close();
        }
        state.sessions.clear();
        state.refreshed_at = None;
    }

    async fn reconcile(&self, state: &mut PoolState) -> Result<(), PoolError> {
        let downstream = self.downstream.upgrade().ok_or(PoolError::SessionGone)?;
        let slugs = match downstream.user_id() {
            Some(user_id) => self.shared.config.user_subscriptions(&user_id).await?,
            None => Vec::new(),
        };

        // drop sessions for slugs the user is no longer subscribed to, and
        // sessions that have reached their terminal state
        let stale: Vec<Slug> = state
            .sessions
            .iter()
            .filter(|(slug, session)| {
                !slugs.contains(slug) || session.status() == SessionStatus::Closed
            })
            .map(|(slug, _)| slug.clone())
            .collect();
        for slug in stale {
            if let Some(session) = state.sessions.remove(&slug) {
                debug!(slug = %slug, "closing upstream session removed from pool");
                session.close();
            }
        }

        let missing: Vec<Slug> = slugs
            .iter()
            .filter(|slug| !state.sessions.contains_key(*slug))
            .cloned()
            .collect();
        let opened = futures::future::join_all(missing.into_iter().map(|slug| {
            let downstream = downstream.clone();
            async move {
                let session = match self.construct(&downstream, slug.clone()).await {
                    Ok(session) => session,
                    Err(error) => {
                        warn!(slug = %slug, %error, "failed to construct upstream session");
                        return None;
                    }
                };
                if let Err(error) = session.open().await {
                    warn!(slug = %slug, %error, "failed to open upstream session");
                    return None;
                }
                Some((slug, session))
            }
        }))
        .await;
        for (slug, session) in opened.into_iter().flatten() {
            state.sessions.insert(slug, session);
        }

        state.refreshed_at = Some(Instant::now());
        Ok(())
    }

    async fn construct(
        &self,
        downstream: &Arc<dyn DownstreamSession>,
        slug: Slug,
    ) -> Result<Arc<UpstreamSession>, ConfigError> {
        let backend = self.shared.config.backend(&slug).await?;
        let headers = HeaderComposer::new(self.shared.config.clone())
            .compose(
                downstream.user_id().as_deref(),
                &slug,
                downstream.remote_addr(),
                downstream.forwarded_for().as_deref(),
            )
            .await;
        let session = UpstreamSession::new(
            slug.clone(),
            backend.url,
            headers,
            downstream.id().into(),
            self.shared.http.clone(),
            self.shared.timeouts,
        );

        // reverse routing: upstream notifications find their way back to the
        // originating downstream session through the registry
        let downstream_id: Arc<str> = downstream.id().into();
        {
            let shared = self.shared.clone();
            let downstream_id = downstream_id.clone();
            let slug = slug.clone();
            session.on_resource_updated(move |uri| {
                subscriptions::route_resource_updated(&shared, &downstream_id, &slug, uri);
            });
        }
        {
            let shared = self.shared.clone();
            session.on_list_changed(move |kind| {
                subscriptions::route_list_changed(&shared, &downstream_id, kind);
            });
        }
        Ok(session)
    }
}
