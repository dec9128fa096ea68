//! In-process implementation of [RawTransport]: all peers live in one [MemoryNetwork], and
//!  packets are moved between per-channel inboxes without touching the network stack.
//!
//! This is primarily used for testing, but it works just as well for running a listener and
//!  its clients inside a single process (e.g. single player sessions).
//!
//! It mimics the raw transport's session bookkeeping: the first packet from a peer without a
//!  session triggers a [TransportNotification::SessionRequest] on the receiving side, and
//!  sending to a peer that is not on the network triggers a
//!  [TransportNotification::SessionFailed] on the sending side.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::config::Reliability;
use crate::transport::notification::{NotificationHub, SessionFailure, TransportNotification};
use crate::transport::{PeerId, RawTransport};


/// Maximum size of a single packet, in line with what P2P SDKs support for reliable sends
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Default)]
struct PeerState {
    online: bool,
    allow_relay: bool,
    inboxes: FxHashMap<u8, VecDeque<(PeerId, Bytes)>>,
    sessions: FxHashSet<PeerId>,
    /// peers that asked for a session that was not accepted yet
    requested_sessions: FxHashSet<PeerId>,
    hub: Option<Arc<NotificationHub>>,
    sent: Vec<SentPacket>,
}

/// A record of a packet that was handed to the network, for assertions in tests
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SentPacket {
    pub to: PeerId,
    pub channel: u8,
    pub reliability: Reliability,
    pub payload: Bytes,
}

struct NetworkInner {
    max_packet_size: usize,
    peers: FxHashMap<PeerId, PeerState>,
}

#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}
impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    pub fn with_max_packet_size(max_packet_size: usize) -> MemoryNetwork {
        MemoryNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                max_packet_size,
                peers: Default::default(),
            })),
        }
    }

    /// Registers a peer on the network (online) and returns its transport
    pub fn add_peer(&self, peer: PeerId) -> Arc<MemoryTransport> {
        self.lock().peers
            .entry(peer)
            .or_default()
            .online = true;

        Arc::new(MemoryTransport {
            peer,
            network: Arc::downgrade(&self.inner),
        })
    }

    /// Taking a peer offline drops everything sent to it until it comes back online
    pub fn set_online(&self, peer: PeerId, online: bool) {
        if let Some(state) = self.lock().peers.get_mut(&peer) {
            state.online = online;
            if !online {
                state.inboxes.clear();
                state.sessions.clear();
                state.requested_sessions.clear();
            }
        }
    }

    /// Simulates the transport reporting a broken session on `peer`'s side with `remote`
    pub fn fail_session(&self, peer: PeerId, remote: PeerId, reason: SessionFailure) {
        let hub = {
            let mut inner = self.lock();
            match inner.peers.get_mut(&peer) {
                Some(state) => {
                    state.sessions.remove(&remote);
                    state.hub.clone()
                }
                None => None,
            }
        };
        if let Some(hub) = hub {
            hub.publish(TransportNotification::SessionFailed { peer: remote, reason });
        }
    }

    /// Puts a raw packet into `to`'s inbox as if `from` had sent it, bypassing session handling
    pub fn inject(&self, from: PeerId, to: PeerId, channel: u8, payload: &[u8]) {
        if let Some(state) = self.lock().peers.get_mut(&to) {
            state.inboxes.entry(channel)
                .or_default()
                .push_back((from, Bytes::copy_from_slice(payload)));
        }
    }

    pub fn has_session(&self, peer: PeerId, remote: PeerId) -> bool {
        self.lock().peers.get(&peer)
            .map(|s| s.sessions.contains(&remote))
            .unwrap_or(false)
    }

    pub fn is_relay_allowed(&self, peer: PeerId) -> bool {
        self.lock().peers.get(&peer)
            .map(|s| s.allow_relay)
            .unwrap_or(false)
    }

    /// returns packets sent by `peer`, clearing the internal record
    pub fn take_sent(&self, peer: PeerId) -> Vec<SentPacket> {
        self.lock().peers.get_mut(&peer)
            .map(|s| std::mem::take(&mut s.sent))
            .unwrap_or_default()
    }

    pub fn num_pending(&self, peer: PeerId, channel: u8) -> usize {
        self.lock().peers.get(&peer)
            .and_then(|s| s.inboxes.get(&channel))
            .map(|inbox| inbox.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        lock_network(&self.inner)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_network(inner: &Mutex<NetworkInner>) -> MutexGuard<'_, NetworkInner> {
    inner.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}


pub struct MemoryTransport {
    peer: PeerId,
    network: Weak<Mutex<NetworkInner>>,
}
impl MemoryTransport {
    fn with_network<R>(&self, default: R, f: impl FnOnce(&mut NetworkInner) -> R) -> R {
        match self.network.upgrade() {
            Some(network) => {
                let mut inner = lock_network(&network);
                f(&mut *inner)
            }
            None => default,
        }
    }
}

impl RawTransport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send(&self, to: PeerId, buf: &[u8], channel: u8, reliability: Reliability) -> bool {
        // notifications are published after releasing the network lock
        let mut notifications: Vec<(Arc<NotificationHub>, TransportNotification)> = Vec::new();

        let result = self.with_network(false, |inner| {
            if buf.len() > inner.max_packet_size {
                debug!(from = ?self.peer, ?to, len = buf.len(), "packet exceeds maximum packet size - refusing");
                return false;
            }

            let target_online = inner.peers.get(&to)
                .map(|s| s.online)
                .unwrap_or(false);

            let Some(sender_state) = inner.peers.get_mut(&self.peer) else {
                return false;
            };
            if !sender_state.online {
                return false;
            }
            sender_state.sent.push(SentPacket {
                to,
                channel,
                reliability,
                payload: Bytes::copy_from_slice(buf),
            });
            let sender_hub = sender_state.hub.clone();

            if !target_online {
                trace!(from = ?self.peer, ?to, "target is not on the network");
                if let Some(hub) = sender_hub {
                    notifications.push((hub, TransportNotification::SessionFailed { peer: to, reason: SessionFailure::DestinationNotLoggedIn }));
                }
                return true;
            }

            // sending implicitly opens the session on the sender's side
            sender_state.sessions.insert(to);

            if let Some(target) = inner.peers.get_mut(&to) {
                if !target.sessions.contains(&self.peer) && target.requested_sessions.insert(self.peer) {
                    if let Some(hub) = target.hub.clone() {
                        notifications.push((hub, TransportNotification::SessionRequest { peer: self.peer }));
                    }
                }
                target.inboxes.entry(channel)
                    .or_default()
                    .push_back((self.peer, Bytes::copy_from_slice(buf)));
            }
            true
        });

        for (hub, notification) in notifications {
            hub.publish(notification);
        }
        result
    }

    fn poll_available(&self, channel: u8) -> Option<usize> {
        self.with_network(None, |inner| {
            inner.peers.get(&self.peer)
                .and_then(|s| s.inboxes.get(&channel))
                .and_then(|inbox| inbox.front())
                .map(|(_, payload)| payload.len())
        })
    }

    fn read_packet(&self, channel: u8, buf: &mut [u8]) -> Option<(usize, PeerId)> {
        self.with_network(None, |inner| {
            let inbox = inner.peers.get_mut(&self.peer)?
                .inboxes.get_mut(&channel)?;

            let (_, payload) = inbox.front()?;
            if payload.len() > buf.len() {
                return None;
            }

            let (from, payload) = inbox.pop_front()?;
            buf[..payload.len()].copy_from_slice(&payload);
            Some((payload.len(), from))
        })
    }

    fn accept_session(&self, peer: PeerId) -> bool {
        self.with_network(false, |inner| {
            match inner.peers.get_mut(&self.peer) {
                Some(state) => {
                    state.requested_sessions.remove(&peer);
                    state.sessions.insert(peer);
                    true
                }
                None => false,
            }
        })
    }

    fn close_session(&self, peer: PeerId) -> bool {
        self.with_network(false, |inner| {
            match inner.peers.get_mut(&self.peer) {
                Some(state) => {
                    state.requested_sessions.remove(&peer);
                    for inbox in state.inboxes.values_mut() {
                        inbox.retain(|(from, _)| *from != peer);
                    }
                    state.sessions.remove(&peer)
                }
                None => false,
            }
        })
    }

    fn allow_relay(&self, allow: bool) {
        self.with_network((), |inner| {
            if let Some(state) = inner.peers.get_mut(&self.peer) {
                state.allow_relay = allow;
            }
        })
    }

    fn attach(&self, hub: Arc<NotificationHub>) {
        self.with_network((), |inner| {
            if let Some(state) = inner.peers.get_mut(&self.peer) {
                state.hub = Some(hub);
            }
        })
    }
}
