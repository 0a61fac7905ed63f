//! Change notification
//!
//! Every version bump yields exactly one [`DataChanged`] event. The event is
//! prepared while the bookkeeping lock is held and returned to the caller as
//! a [`PendingNotification`]; it is only dispatched once the lock has been
//! released, so listeners may call back into the object freely.

use crate::snapshot::Snapshot;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vox_core::ObjectId;

/// Why a new snapshot was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    /// First snapshot of a freshly created object
    Initialized,
    /// An update started running
    NewUpdate,
    /// An update finished (normally or through the drop fallback)
    UpdateFinished,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::NewUpdate => "NewUpdate",
            Self::UpdateFinished => "UpdateFinished",
        }
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted after each version bump
#[derive(Debug, Clone)]
pub struct DataChanged {
    pub object: ObjectId,
    pub snapshot: Arc<Snapshot>,
    pub reason: ChangeReason,
}

/// Subscriber ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Callback listener type
pub type ChangeListener = Arc<dyn Fn(&DataChanged) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Callback(ChangeListener),
    Channel(Sender<DataChanged>),
}

/// Fan-out of [`DataChanged`] events for one object
pub(crate) struct ChangeNotifier {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(SubscriberId, Subscriber)>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, subscriber: Subscriber) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriberId
    where
        F: Fn(&DataChanged) + Send + Sync + 'static,
    {
        self.add(Subscriber::Callback(Arc::new(listener)))
    }

    /// Subscribe through a channel; `capacity == None` means unbounded
    pub fn subscribe_channel(&self, capacity: Option<usize>) -> (SubscriberId, Receiver<DataChanged>) {
        let (tx, rx) = match capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        (self.add(Subscriber::Channel(tx)), rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver to every subscriber; never called with the bookkeeping lock held
    pub fn emit(&self, event: &DataChanged) {
        let subscribers = self.subscribers.read().clone();
        let mut disconnected = Vec::new();

        for (id, subscriber) in subscribers {
            match subscriber {
                Subscriber::Callback(listener) => listener(event),
                Subscriber::Channel(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Dropping {} notification for {}: subscriber {:?} is full",
                            event.reason,
                            event.object,
                            id
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => disconnected.push(id),
                },
            }
        }

        if !disconnected.is_empty() {
            self.subscribers
                .write()
                .retain(|(id, _)| !disconnected.contains(id));
        }
    }
}

/// A change event computed under the bookkeeping lock, to be dispatched after it is released
#[must_use = "the notification must be dispatched once the lock is released"]
pub(crate) struct PendingNotification {
    event: DataChanged,
}

impl PendingNotification {
    pub fn new(snapshot: Arc<Snapshot>, reason: ChangeReason) -> Self {
        Self {
            event: DataChanged {
                object: snapshot.object_id(),
                snapshot,
                reason,
            },
        }
    }

    pub fn dispatch(self, notifier: &ChangeNotifier) {
        notifier.emit(&self.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Metadata, VersionToken};
    use std::sync::Weak;

    fn event(seq: u64, reason: ChangeReason) -> PendingNotification {
        let snapshot = Snapshot::new(
            Weak::new(),
            ObjectId::from_raw(1),
            VersionToken::new(seq, false),
            Metadata::new(),
        );
        PendingNotification::new(snapshot, reason)
    }

    #[test]
    fn test_callback_and_channel_delivery() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        notifier.subscribe(move |e| {
            counter.store(e.snapshot.sequence(), Ordering::SeqCst);
        });
        let (_, rx) = notifier.subscribe_channel(None);

        event(5, ChangeReason::UpdateFinished).dispatch(&notifier);

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.reason, ChangeReason::UpdateFinished);
    }

    #[test]
    fn test_disconnected_channels_are_pruned() {
        let notifier = ChangeNotifier::new();
        let (_, rx) = notifier.subscribe_channel(Some(4));
        assert_eq!(notifier.len(), 1);
        drop(rx);

        event(1, ChangeReason::NewUpdate).dispatch(&notifier);
        assert_eq!(notifier.len(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let notifier = ChangeNotifier::new();
        let id = notifier.subscribe(|_| {});
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
    }
}
