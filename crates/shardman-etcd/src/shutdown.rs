//! Broadcast-based cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

struct Inner {
    triggered: AtomicBool,
    sender: broadcast::Sender<()>,
}

/// A cancellation signal shared across tasks.
///
/// `trigger()` releases every waiter, including ones that start waiting
/// after the fact. Triggering more than once is harmless.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                sender,
            }),
        }
    }

    /// Fire the signal. Subsequent triggers are no-ops.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let _ = self.inner.sender.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolves once the signal fires; immediately if it already has.
    ///
    /// Cancel-safe: dropping the future only drops a broadcast receiver.
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        let mut rx = self.inner.sender.subscribe();
        // Re-check after subscribing: a trigger between the first check and
        // the subscribe would otherwise be missed.
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
