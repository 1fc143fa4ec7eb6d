use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation signal shared between a stream's producer and consumer.
///
/// The bridge uses one handle per caller connection (fired when the response
/// body is dropped) and one per backend attempt (fired to abort the backend
/// request on disconnect or failover).
#[derive(Clone)]
pub struct StreamCancelHandle {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    /// Set once the stream reached its terminal frame normally
    completed: Arc<AtomicBool>,
}

impl StreamCancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            completed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the stream as completed normally.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Signal cancellation. No-op once the stream completed normally.
    pub fn cancel(&self) {
        if !self.is_completed() {
            self.sender.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation has been signalled.
    ///
    /// Cancel-safe, so it can sit in a `tokio::select!` branch.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any handle, so this only errors if every
        // handle is gone, in which case nobody is waiting anyway.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for StreamCancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
