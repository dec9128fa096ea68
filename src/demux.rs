use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::ConnectionOptions;
use crate::handshake::control_messages::ControlMessage;
use crate::transport::runtime::TransportRuntime;
use crate::transport::PeerId;


/// Where the demultiplexer hands off what it read. Implemented by the listener (routing by
///  identity map) and by client connections (single remote peer).
#[cfg_attr(test, automock)]
pub trait PacketRouter: Send + Sync {
    fn on_control(&self, peer: PeerId, msg: ControlMessage);

    /// Returns `false` if the packet was dropped, e.g. because the sender did not complete
    ///  the handshake
    fn route_data(&self, peer: PeerId, channel: u8, payload: Bytes) -> bool;

    /// The route of a closed router can be taken over by a new registration
    fn is_closed(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PollStats {
    /// control messages dispatched to the handshake
    pub control: usize,
    /// data packets that were queued on a connection
    pub delivered: usize,
    /// data packets without an established connection, packets without a route, and
    ///  malformed control packets
    pub dropped: usize,
}
impl PollStats {
    pub fn is_empty(&self) -> bool {
        self.control == 0 && self.delivered == 0 && self.dropped == 0
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum RouteError {
    #[error("{registered} data channels are in use on this transport runtime, {requested} were requested")]
    ChannelLayoutMismatch { registered: u8, requested: u8 },
    #[error("there is already a connection to {0:?} on this transport runtime")]
    PeerTaken(PeerId),
    #[error("there is already a listener on this transport runtime")]
    ListenerTaken,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RouteKey {
    Peer(PeerId),
    Listener,
}

#[derive(Debug, Copy, Clone)]
struct ChannelLayout {
    num_data_channels: u8,
    max_poll_batch_size: usize,
}

#[derive(Default)]
struct RouteTable {
    /// taken from the first registration, and reset when the last one is gone
    layout: Option<ChannelLayout>,
    by_peer: FxHashMap<PeerId, Weak<dyn PacketRouter>>,
    listener: Option<Weak<dyn PacketRouter>>,
}
impl RouteTable {
    fn check_layout(&mut self, options: &ConnectionOptions) -> Result<(), RouteError> {
        match self.layout {
            Some(layout) if layout.num_data_channels != options.num_data_channels() => {
                Err(RouteError::ChannelLayoutMismatch {
                    registered: layout.num_data_channels,
                    requested: options.num_data_channels(),
                })
            }
            Some(_) => Ok(()),
            None => {
                self.layout = Some(ChannelLayout {
                    num_data_channels: options.num_data_channels(),
                    max_poll_batch_size: options.max_poll_batch_size,
                });
                Ok(())
            }
        }
    }

    /// A client route for the sender takes precedence, everything else goes to the listener
    fn router_for(&self, peer: PeerId) -> Option<Arc<dyn PacketRouter>> {
        self.by_peer.get(&peer)
            .and_then(Weak::upgrade)
            .or_else(|| self.listener.as_ref().and_then(Weak::upgrade))
    }

    fn remove(&mut self, key: RouteKey, router: &Weak<dyn PacketRouter>) {
        match key {
            RouteKey::Peer(peer) => {
                if self.by_peer.get(&peer).is_some_and(|r| Weak::ptr_eq(r, router)) {
                    self.by_peer.remove(&peer);
                }
            }
            RouteKey::Listener => {
                if self.listener.as_ref().is_some_and(|r| Weak::ptr_eq(r, router)) {
                    self.listener = None;
                }
            }
        }

        if self.by_peer.is_empty() && self.listener.is_none() {
            self.layout = None;
        }
    }
}

fn is_live(router: &Weak<dyn PacketRouter>) -> bool {
    router.upgrade()
        .is_some_and(|r| !r.is_closed())
}

fn lock_routes(routes: &Mutex<RouteTable>) -> MutexGuard<'_, RouteTable> {
    routes.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A route registered with a [Demultiplexer]. Dropping it unregisters the route.
pub struct RouteRegistration {
    routes: Arc<Mutex<RouteTable>>,
    key: RouteKey,
    router: Weak<dyn PacketRouter>,
}
impl Drop for RouteRegistration {
    fn drop(&mut self) {
        trace!(key = ?self.key, "unregistering route");
        lock_routes(&self.routes).remove(self.key, &self.router);
    }
}

/// There is exactly one demultiplexer per [TransportRuntime], and it is the only reader of the
///  raw transport's channels. Each poll cycle reads everything that is currently available,
///  control channel first, and hands each packet to the router registered for its sender:
///  a client connection to that peer if there is one, the runtime's listener otherwise.
///  Packets without a route are dropped.
///
/// Reading is non-blocking and bounded per channel by [ConnectionOptions::max_poll_batch_size],
///  so a single flooded channel delays the others by at most one batch. Poll cycles do not
///  overlap: a cycle that is started while another one is running reads nothing, so packets
///  from a channel are always dispatched in the order they were read.
pub struct Demultiplexer {
    routes: Arc<Mutex<RouteTable>>,
    polling: Mutex<()>,
}
impl Demultiplexer {
    pub fn new() -> Demultiplexer {
        Demultiplexer {
            routes: Default::default(),
            polling: Mutex::new(()),
        }
    }

    /// Routes everything from `peer` to `router`. There can be only one live route per peer.
    pub fn register_peer(&self, peer: PeerId, router: Weak<dyn PacketRouter>, options: &ConnectionOptions) -> Result<RouteRegistration, RouteError> {
        let mut routes = lock_routes(&self.routes);
        routes.check_layout(options)?;
        if routes.by_peer.get(&peer).is_some_and(is_live) {
            return Err(RouteError::PeerTaken(peer));
        }

        debug!(?peer, "registering route");
        routes.by_peer.insert(peer, router.clone());
        Ok(RouteRegistration {
            routes: self.routes.clone(),
            key: RouteKey::Peer(peer),
            router,
        })
    }

    /// Routes everything without a peer route to `router`
    pub fn register_listener(&self, router: Weak<dyn PacketRouter>, options: &ConnectionOptions) -> Result<RouteRegistration, RouteError> {
        let mut routes = lock_routes(&self.routes);
        routes.check_layout(options)?;
        if routes.listener.as_ref().is_some_and(is_live) {
            return Err(RouteError::ListenerTaken);
        }

        debug!("registering listener route");
        routes.listener = Some(router.clone());
        Ok(RouteRegistration {
            routes: self.routes.clone(),
            key: RouteKey::Listener,
            router,
        })
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub fn poll_once(&self, runtime: &TransportRuntime) -> PollStats {
        let _polling = match self.polling.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                trace!("poll cycle already running - skipping");
                return PollStats::default();
            }
        };

        let mut stats = PollStats::default();
        let Some(layout) = lock_routes(&self.routes).layout else {
            return stats;
        };

        let control_channel = layout.num_data_channels;
        for _ in 0..layout.max_poll_batch_size {
            let Some((peer, buf)) = read_next(runtime, control_channel) else {
                break;
            };
            let msg = match ControlMessage::deser(&buf) {
                Ok(msg) => msg,
                Err(e) => {
                    stats.dropped += 1;
                    warn!(?peer, "malformed control packet - ignoring: {}", e);
                    continue;
                }
            };
            match self.router_for(peer) {
                Some(router) => {
                    stats.control += 1;
                    router.on_control(peer, msg);
                }
                None => {
                    stats.dropped += 1;
                    debug!(?peer, ?msg, "no route for control message - dropping");
                }
            }
        }

        for channel in 0..layout.num_data_channels {
            for _ in 0..layout.max_poll_batch_size {
                let Some((peer, payload)) = read_next(runtime, channel) else {
                    break;
                };
                let routed = self.router_for(peer)
                    .is_some_and(|router| router.route_data(peer, channel, payload));
                if routed {
                    stats.delivered += 1;
                }
                else {
                    trace!(?peer, channel, "dropping data packet from peer without an established connection");
                    stats.dropped += 1;
                }
            }
        }

        stats
    }

    fn router_for(&self, peer: PeerId) -> Option<Arc<dyn PacketRouter>> {
        lock_routes(&self.routes).router_for(peer)
    }
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

fn read_next(runtime: &TransportRuntime, channel: u8) -> Option<(PeerId, Bytes)> {
    let len = runtime.poll_available(channel)?;

    let mut buf = BytesMut::zeroed(len);
    let (n, peer) = runtime.read_packet(channel, &mut buf)?;
    buf.truncate(n);
    Some((peer, buf.freeze()))
}
