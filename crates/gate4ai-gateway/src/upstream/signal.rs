use tokio::sync::watch;

/// One-shot, multi-waiter completion signal.
///
/// The first `set` wins; later `set` calls are ignored. Any number of tasks
/// may `wait` before or after the value lands and all observe the same value.
pub(crate) struct OnceSignal<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> OnceSignal<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Returns `true` if this call set the value, `false` if it was already
    /// set.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // the sender lives in self, so the channel cannot close here
            rx.changed().await.expect("signal sender dropped");
        }
    }
}
