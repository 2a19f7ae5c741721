use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{ProductionError, WaitError};

type Resolution = Option<Result<(), ProductionError>>;

/// A single-result completion signal with any number of observers.
///
/// The waiter is resolved exactly once, by the task running a production. Every current and
/// future call to one of the `wait` methods observes that same result.
pub struct Waiter {
    tx: watch::Sender<Resolution>,
}

impl Waiter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolves the waiter with `result`, waking up all current waiters.
    ///
    /// Only the first call has an effect. Returns `true` if this call resolved the waiter.
    pub fn resolve(&self, result: Result<(), ProductionError>) -> bool {
        let resolved = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });
        if !resolved {
            tracing::trace!("Ignoring duplicate waiter resolution");
        }
        resolved
    }

    /// Whether [`resolve`](Self::resolve) has already been called.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits until the waiter is resolved and returns the production result.
    pub async fn wait(&self) -> Result<(), ProductionError> {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel can not close while we wait on it.
        let resolution = match rx.wait_for(Option::is_some).await {
            Ok(resolution) => resolution.clone(),
            Err(_) => None,
        };
        resolution.unwrap_or(Err(ProductionError::Aborted))
    }

    /// Like [`wait`](Self::wait), but gives up with [`WaitError::Canceled`] once `token` is
    /// cancelled.
    ///
    /// A resolution that is already available always wins over the cancellation.
    pub async fn wait_with_cancel(&self, token: &CancellationToken) -> Result<(), WaitError> {
        tokio::select! {
            biased;
            result = self.wait() => result.map_err(WaitError::from),
            _ = token.cancelled() => Err(WaitError::Canceled),
        }
    }

    /// Like [`wait`](Self::wait), but gives up with [`WaitError::DeadlineExceeded`] after
    /// `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), WaitError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map_err(WaitError::from),
            Err(_) => Err(WaitError::DeadlineExceeded),
        }
    }
}

/// Resolves a [`Waiter`] with [`ProductionError::Aborted`] when dropped, unless it was resolved
/// in the meantime.
///
/// Production tasks hold one of these, so that waiters do not hang when a task is dropped
/// before it finishes, for example while the runtime shuts down.
pub(crate) struct AbortGuard {
    waiter: Arc<Waiter>,
    on_abort: Option<Box<dyn FnOnce() + Send>>,
}

impl AbortGuard {
    pub fn new(waiter: Arc<Waiter>) -> Self {
        Self {
            waiter,
            on_abort: None,
        }
    }

    /// Runs `f` right before the waiter is resolved as aborted.
    pub fn on_abort<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_abort = Some(Box::new(f));
        self
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.waiter.is_resolved() {
            tracing::debug!("Production dropped before completion");
            if let Some(on_abort) = self.on_abort.take() {
                on_abort();
            }
            self.waiter.resolve(Err(ProductionError::Aborted));
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("resolution", &*self.tx.borrow())
            .finish()
    }
}
