use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Single-settlement result slot shared by every attempt of one logical call.
///
/// Clones point at the same slot. The first `resolve` or `reject` wins; any
/// later settle is ignored and reports `false`.
#[derive(Debug)]
pub struct Deferred<T, E> {
    inner: Arc<Shared<T, E>>,
}

#[derive(Debug)]
struct Shared<T, E> {
    slot: Mutex<Option<Result<T, E>>>,
    settled: Condvar,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Deferred<T, E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                slot: Mutex::new(None),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.lock().is_some()
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.inner.settled.notify_all();
        true
    }

    fn lock(&self) -> MutexGuard<'_, Option<Result<T, E>>> {
        // A poisoned slot still holds a consistent Option.
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    /// Block until the handle settles and return a copy of the outcome.
    pub fn wait(&self) -> Result<T, E> {
        let mut slot = self.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .inner
                .settled
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn try_outcome(&self) -> Option<Result<T, E>> {
        self.lock().clone()
    }
}
