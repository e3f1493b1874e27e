//! Per-call context.
//!
//! Carries the namespace a call is addressed to and an optional deadline and
//! cancellation signal for network-bound operations.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::namespace::DEFAULT_NAMESPACE;

/// Returned when a guarded operation is cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Cancelled {
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,
}

/// Context passed along every outbox, bus and handler call.
///
/// Cheap to clone; clones share the same cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct Context {
    namespace: Option<String>,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`Context`] derived from [`Context::with_cancel`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the call to `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Namespace carried by this context, or [`DEFAULT_NAMESPACE`].
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Bound the call by `timeout` from now. An earlier deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Derive a cancellable context.
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Fail now if the context is already cancelled or past its deadline.
    /// Cancellation wins over an expired deadline, as in [`Context::guard`].
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Err(Cancelled::Cancelled);
        }
        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            return Err(Cancelled::DeadlineExceeded);
        }
        Ok(())
    }

    /// Race `fut` against this context's deadline and cancellation signal.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        let deadline = self.deadline;
        let cancel = self.cancel.clone();

        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancelled = async move {
            let Some(mut rx) = cancel else {
                return std::future::pending::<()>().await;
            };
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling.
                    return std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(Cancelled::Cancelled),
            _ = expired => Err(Cancelled::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
