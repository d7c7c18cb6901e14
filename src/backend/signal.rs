//! Cross-stage re-emission signal.
//!
//! Any stage may [`ReemitSignal::send`]. The request is latched and only
//! handed to subscribers when the supervising host calls
//! [`ReemitSignal::deliver`] from its polling loop, so delivery happens at a
//! known point and in subscription order. Listeners coalesce: several
//! requests between two ticks are observed as one.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct SignalShared {
    pending: AtomicBool,
    subscribers: Mutex<Vec<Sender<()>>>,
}

/// Payload-free broadcast asking source stages to re-publish their last frame.
#[derive(Clone, Default)]
pub struct ReemitSignal {
    shared: Arc<SignalShared>,
}

impl ReemitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a re-emission. Cheap and callable from any thread.
    pub fn send(&self) {
        self.shared.pending.store(true, Ordering::Release);
    }

    /// Whether a request is waiting for delivery.
    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Register a listener.
    pub fn subscribe(&self) -> SignalListener {
        let (tx, rx) = bounded(1);
        self.shared.subscribers.lock().push(tx);
        SignalListener { rx }
    }

    /// Hand a latched request to every live listener. Returns the number of
    /// listeners notified. Called by the host at its polling points.
    pub fn deliver(&self) -> usize {
        if !self.shared.pending.swap(false, Ordering::AcqRel) {
            return 0;
        }
        let mut subscribers = self.shared.subscribers.lock();
        let mut notified = 0;
        subscribers.retain(|tx| match tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {
                notified += 1;
                true
            }
            Err(TrySendError::Disconnected(())) => false,
        });
        tracing::trace!("Re-emit delivered to {} listener(s)", notified);
        notified
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }
}

impl std::fmt::Debug for ReemitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReemitSignal")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Receiving end of a [`ReemitSignal`] subscription.
pub struct SignalListener {
    rx: Receiver<()>,
}

impl SignalListener {
    /// Consume a delivered request, if any.
    pub fn take(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
