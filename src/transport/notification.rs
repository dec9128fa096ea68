use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use num_enum::FromPrimitive;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::trace;

use crate::transport::PeerId;


/// The reason a raw session could not be established or broke down, as reported by the raw
///  transport. The raw code is preserved for diagnostics, including codes this crate does not
///  know about.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum SessionFailure {
    /// the remote peer is not running the same application
    NotRunningApp = 1,
    /// the local user does not own the application that is running
    NoRightsToApp = 2,
    /// the remote peer is not logged in to the transport provider's network
    DestinationNotLoggedIn = 3,
    /// the remote peer did not respond
    Timeout = 4,
    #[num_enum(catch_all)]
    Other(u8),
}
impl SessionFailure {
    pub fn code(&self) -> u8 {
        match *self {
            SessionFailure::NotRunningApp => 1,
            SessionFailure::NoRightsToApp => 2,
            SessionFailure::DestinationNotLoggedIn => 3,
            SessionFailure::Timeout => 4,
            SessionFailure::Other(code) => code,
        }
    }
}

impl Display for SessionFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionFailure::NotRunningApp => write!(f, "the target peer is not running the same application"),
            SessionFailure::NoRightsToApp => write!(f, "the local user does not own the application that is running"),
            SessionFailure::DestinationNotLoggedIn => write!(f, "the target peer is not connected to the network"),
            SessionFailure::Timeout => write!(f, "the target peer did not respond"),
            SessionFailure::Other(code) => write!(f, "unknown session error {}", code),
        }
    }
}


/// Asynchronous events pushed by the raw transport, typically from its own callback thread
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportNotification {
    /// A remote peer started sending to us, and the transport asks whether to accept the session
    SessionRequest { peer: PeerId },
    /// A session with a remote peer failed or could not be established
    SessionFailed { peer: PeerId, reason: SessionFailure },
}
impl TransportNotification {
    pub fn peer(&self) -> PeerId {
        match self {
            TransportNotification::SessionRequest { peer } => *peer,
            TransportNotification::SessionFailed { peer, .. } => *peer,
        }
    }
}


/// Fan-out point for [TransportNotification]s. The raw transport publishes to it (from any
///  thread), and every [Subscription] receives each notification published while it exists.
///
/// NB: Registration is scoped - dropping a [Subscription] unregisters it, and nothing is
///      delivered to it afterwards.
#[derive(Default)]
pub struct NotificationHub {
    next_subscription_id: AtomicU64,
    subscribers: Mutex<FxHashMap<u64, mpsc::UnboundedSender<TransportNotification>>>,
}
impl NotificationHub {
    pub fn new() -> Arc<NotificationHub> {
        Arc::new(NotificationHub::default())
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock_subscribers().insert(id, sender);

        Subscription {
            id,
            hub: Arc::downgrade(self),
            receiver,
        }
    }

    pub fn publish(&self, notification: TransportNotification) {
        trace!(?notification, "publishing transport notification");
        let subscribers = self.lock_subscribers();
        for sender in subscribers.values() {
            // a failed send means the subscription is being dropped concurrently
            let _ = sender.send(notification.clone());
        }
    }

    pub fn num_subscribers(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock_subscribers().remove(&id);
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, FxHashMap<u64, mpsc::UnboundedSender<TransportNotification>>> {
        // the map stays consistent even if a holder panicked
        self.subscribers.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Subscription {
    id: u64,
    hub: Weak<NotificationHub>,
    receiver: mpsc::UnboundedReceiver<TransportNotification>,
}
impl Subscription {
    /// Waits for the next notification, returning `None` if the hub is gone
    pub async fn recv(&mut self) -> Option<TransportNotification> {
        self.receiver.recv().await
    }

    /// Returns the next already published notification without waiting
    pub fn try_recv(&mut self) -> Option<TransportNotification> {
        match self.receiver.try_recv() {
            Ok(n) => Some(n),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
        self.receiver.close();
    }
}
