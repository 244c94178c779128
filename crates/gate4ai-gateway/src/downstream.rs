//! The seam toward the layer that owns client-facing MCP sessions.
//!
//! The transport layer implements [`DownstreamSession`]; the core keeps its
//! own strongly typed per-session state ([`SessionState`]) in a process-wide
//! registry keyed by session id. Upstream sessions route notifications back
//! through that registry rather than holding the downstream session alive:
//! if the client is gone, the `Weak` upgrade fails and the notification is
//! dropped.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex, RwLock, Weak},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{
    aggregate::Wrapped,
    model::{Prompt, Resource, Tool},
    pool::SessionPool,
};

pub type SessionId = Arc<str>;

#[derive(Debug, Error)]
#[error("failed to deliver notification: {0}")]
pub struct NotificationError(pub String);

/// One client-facing MCP session, as the core sees it.
#[async_trait]
pub trait DownstreamSession: Send + Sync {
    /// Stable id for the lifetime of the session.
    fn id(&self) -> &str;
    /// Authenticated user, when the transport knows one.
    fn user_id(&self) -> Option<String>;
    /// Peer address of the client connection.
    fn remote_addr(&self) -> Option<SocketAddr>;
    /// `X-Forwarded-For` of the original client request, if it carried one.
    fn forwarded_for(&self) -> Option<String>;
    /// Push a notification to the client.
    async fn send_notification(&self, method: &str, params: Value)
    -> Result<(), NotificationError>;
}

/// A value with a freshness stamp. `get` answers only within the TTL; there
/// is no background invalidation.
pub(crate) struct TtlCell<T> {
    slot: Mutex<Option<(T, Instant)>>,
    ttl: Duration,
}

impl<T: Clone> TtlCell<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            ttl,
        }
    }

    pub fn get(&self) -> Option<T> {
        let slot = self.lock();
        match slot.as_ref() {
            Some((value, stamp)) if stamp.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn set(&self, value: T) {
        *self.lock() = Some((value, Instant::now()));
    }

    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(T, Instant)>> {
        self.slot.lock().expect("ttl cell lock poisoned")
    }
}

/// Typed per-downstream-session state: the pool, the wrapped list caches and
/// the set of active gateway-visible subscriptions.
pub(crate) struct SessionState {
    pub session: Weak<dyn DownstreamSession>,
    pub pool: SessionPool,
    pub tools: TtlCell<Arc<Vec<Wrapped<Tool>>>>,
    pub prompts: TtlCell<Arc<Vec<Wrapped<Prompt>>>>,
    pub resources: TtlCell<Arc<Vec<Wrapped<Resource>>>>,
    /// Gateway-visible URIs with a live upstream subscription. The lock is
    /// held across the upstream forward so concurrent subscribes coalesce.
    pub subscriptions: tokio::sync::Mutex<HashSet<String>>,
}

impl SessionState {
    pub fn new(session: Weak<dyn DownstreamSession>, pool: SessionPool, ttl: Duration) -> Self {
        Self {
            session,
            pool,
            tools: TtlCell::new(ttl),
            prompts: TtlCell::new(ttl),
            resources: TtlCell::new(ttl),
            subscriptions: tokio::sync::Mutex::new(HashSet::new()),
        }
    }
}

/// Process-wide map of downstream session id → state.
pub(crate) struct SessionRegistry {
    inner: RwLock<HashMap<SessionId, Arc<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: SessionId, state: Arc<SessionState>) {
        self.write().insert(id, state);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionState>> {
        self.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.read().get(id).cloned()
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<SessionState>>> {
        self.inner.read().expect("session registry lock poisoned")
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<SessionState>>> {
        self.inner.write().expect("session registry lock poisoned")
    }
}
