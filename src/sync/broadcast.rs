//! State Change Broadcaster
//!
//! Single-slot observer registration: registering a new observer detaches the
//! previous one. Delivery is synchronous on the engine's thread; observers that
//! need their own thread marshal there themselves, e.g. via [`ChannelObserver`].

use super::models::{StateChange, SyncState};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Receives state transitions. Counters are pulled from the progress counter.
pub trait StateObserver: Send + Sync {
    fn on_state_changed(&self, old: SyncState, new: SyncState);
}

#[derive(Default)]
pub struct StateChangeBroadcaster {
    observer: RwLock<Option<Arc<dyn StateObserver>>>,
}

impl StateChangeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`, silently detaching any previous one
    pub fn register(&self, observer: Arc<dyn StateObserver>) {
        let mut slot = match self.observer.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.replace(observer).is_some() {
            log::debug!("Replaced previously registered state observer");
        }
    }

    pub fn unregister(&self) {
        let mut slot = match self.observer.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take();
    }

    pub fn has_observer(&self) -> bool {
        match self.observer.read() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Deliver a transition. A panicking observer is logged and otherwise ignored.
    pub fn notify(&self, old: SyncState, new: SyncState) {
        let observer = match self.observer.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        if let Some(observer) = observer {
            let result = catch_unwind(AssertUnwindSafe(|| observer.on_state_changed(old, new)));
            if result.is_err() {
                log::warn!("State observer panicked on {} -> {}", old, new);
            }
        }
    }
}

/// Observer that forwards transitions over an unbounded channel, for consumers
/// that process them on their own thread or task. Never blocks the engine.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StateChange>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateObserver for ChannelObserver {
    fn on_state_changed(&self, old: SyncState, new: SyncState) {
        if self.tx.send(StateChange { old, new }).is_err() {
            log::debug!("State change receiver dropped, discarding {} -> {}", old, new);
        }
    }
}
