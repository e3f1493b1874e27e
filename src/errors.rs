//! Out-of-band error reporting.
//!
//! Outboxes and buses report asynchronous failures (handler errors,
//! transport errors, dead-lettered entries) on a bounded channel.
//!
//! # Overflow policy
//!
//! Reporting never blocks the delivery path. When the channel is full the
//! **newest** error is dropped, the drop counter is incremented and a
//! warning is logged. Every report is also logged at `error` level, so a
//! dropped report is still visible in the logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::event::Event;

/// Default capacity of an error channel.
pub const DEFAULT_ERROR_CAPACITY: usize = 100;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// An asynchronous delivery or transport failure.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct DeliveryError {
    pub source: BoxError,
    /// Namespace the failing call was addressed to.
    pub namespace: String,
    /// The event being delivered, when the failure concerns one.
    pub event: Option<Arc<Event>>,
}

impl DeliveryError {
    pub fn new(
        source: impl Into<BoxError>,
        namespace: impl Into<String>,
        event: Option<Arc<Event>>,
    ) -> Self {
        Self {
            source: source.into(),
            namespace: namespace.into(),
            event,
        }
    }
}

/// Sending half of an error channel, owned by the reporting component.
#[derive(Clone)]
pub struct ErrorChannel {
    tx: mpsc::Sender<DeliveryError>,
    rx: Arc<Mutex<mpsc::Receiver<DeliveryError>>>,
    dropped: Arc<AtomicU64>,
}

impl ErrorChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Report an error without blocking.
    pub fn report(&self, err: DeliveryError) {
        error!(
            namespace = %err.namespace,
            event = ?err.event.as_ref().map(|e| e.to_string()),
            error = %err,
            "Delivery error"
        );
        self.forward(err);
    }

    /// Queue an error that was already logged where it occurred.
    pub fn forward(&self, err: DeliveryError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    dropped_total = total,
                    error = %dropped,
                    "Error channel full, dropping newest error"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Error channel closed, discarding error");
            }
        }
    }

    /// Receiving handle. All receivers share one queue; each error is
    /// observed by exactly one of them.
    pub fn receiver(&self) -> ErrorReceiver {
        ErrorReceiver {
            rx: Arc::clone(&self.rx),
        }
    }

    /// Number of errors dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_CAPACITY)
    }
}

/// Receiving half returned by `errors()` on outboxes and buses.
#[derive(Clone)]
pub struct ErrorReceiver {
    rx: Arc<Mutex<mpsc::Receiver<DeliveryError>>>,
}

impl ErrorReceiver {
    /// Wait for the next error. Returns `None` once the reporting component
    /// has been dropped and the queue drained.
    pub async fn recv(&self) -> Option<DeliveryError> {
        self.rx.lock().await.recv().await
    }

    /// Next queued error, if any, without waiting.
    pub fn try_recv(&self) -> Option<DeliveryError> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[tokio::test]
    async fn test_report_and_receive() {
        let channel = ErrorChannel::new(4);
        channel.report(DeliveryError::new(Boom(1), "default", None));

        let err = channel.receiver().recv().await.unwrap();
        assert_eq!(err.to_string(), "boom 1");
        assert_eq!(err.namespace, "default");
    }

    #[tokio::test]
    async fn test_full_channel_drops_newest() {
        let channel = ErrorChannel::new(2);
        for i in 0..5 {
            channel.report(DeliveryError::new(Boom(i), "default", None));
        }

        assert_eq!(channel.dropped(), 3);
        let rx = channel.receiver();
        assert_eq!(rx.try_recv().unwrap().to_string(), "boom 0");
        assert_eq!(rx.try_recv().unwrap().to_string(), "boom 1");
        assert!(rx.try_recv().is_none());
    }
}
