use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{ServiceError, model::RequestId};

pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Value, ServiceError>>;

struct Pending {
    tx: oneshot::Sender<Result<Value, ServiceError>>,
    deadline: Instant,
}

/// Maps in-flight request ids to their continuations.
///
/// Delivery is exactly-once per id: the entry is removed before the send, so
/// a racing timeout and response cannot both fire. Deadlines are enforced by
/// the session's sweeper calling [`Correlator::sweep`].
pub(crate) struct Correlator {
    pending: Mutex<HashMap<RequestId, Pending>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: RequestId, deadline: Instant) -> ResponseReceiver {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, Pending { tx, deadline });
        rx
    }

    /// Hand a response (or a synthesized error) to the waiting continuation.
    /// Returns `false` for ids with no pending entry.
    pub fn deliver(&self, id: &RequestId, outcome: Result<Value, ServiceError>) -> bool {
        let Some(pending) = self.lock().remove(id) else {
            warn!(%id, "dropping response for unknown request id");
            return false;
        };
        // the receiver may already be gone (caller cancelled); that is fine
        pending.tx.send(outcome).ok();
        true
    }

    /// Drop a pending entry without completing it (the caller went away).
    pub fn remove(&self, id: &RequestId) {
        self.lock().remove(id);
    }

    /// Fail every pending request, e.g. when the session closes.
    pub fn cancel_all(&self, error: ServiceError) {
        let drained: Vec<Pending> = self.lock().drain().map(|(_, pending)| pending).collect();
        for pending in drained {
            pending.tx.send(Err(error.clone())).ok();
        }
    }

    /// Time out every entry whose deadline has passed.
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<Pending> = {
            let mut pending = self.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        for entry in expired {
            entry.tx.send(Err(ServiceError::Timeout)).ok();
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Pending>> {
        self.pending.lock().expect("correlator lock poisoned")
    }
}
