//! The accepting side: a [Listener] answers CONNECT requests, keeps track of established
//!  connections in an [IdentityMap] and routes their data packets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, info_span, trace, warn};

use crate::config::ConnectionOptions;
use crate::connection::{Connection, ConnectionOwner, ConnectionShared};
use crate::demux::{PacketRouter, PollStats, RouteRegistration};
use crate::driver::{DriverHandle, Pump};
use crate::error::ConnectionError;
use crate::handshake::control_messages::ControlMessage;
use crate::handshake::control_sink::TransportControlSink;
use crate::handshake::{CloseReason, Handshake, HandshakeOutcome, Role};
use crate::identity_map::{ConnectionId, IdentityMap};
use crate::transport::notification::{Subscription, TransportNotification};
use crate::transport::runtime::TransportRuntime;
use crate::transport::PeerId;


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ListenerEvent {
    Connected { id: ConnectionId, peer: PeerId },
    Disconnected { id: ConnectionId, peer: PeerId, reason: CloseReason },
    /// a CONNECT was answered with REJECT_TOO_MANY
    Rejected { peer: PeerId },
}

const EVENT_CHANNEL_CAPACITY: usize = 128;

struct ListenerState {
    identity_map: IdentityMap,
    connections: FxHashMap<ConnectionId, Connection>,
    next_id: u32,
    accepted: Option<mpsc::UnboundedSender<Connection>>,
}
impl ListenerState {
    /// ids come from a counter, skipping ids that are still in use after wrap-around
    fn allocate_id(&mut self) -> ConnectionId {
        loop {
            let id = ConnectionId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if self.identity_map.lookup_id(id).is_none() {
                return id;
            }
        }
    }
}

struct ListenerInner {
    myself: Weak<ListenerInner>,
    runtime: Arc<TransportRuntime>,
    options: Arc<ConnectionOptions>,
    sink: Arc<TransportControlSink>,
    state: Mutex<ListenerState>,
    /// released when the listener stops
    notifications: Mutex<Option<Subscription>>,
    events: broadcast::Sender<ListenerEvent>,
    stopped: AtomicBool,
}
impl ListenerInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_event(&self, event: ListenerEvent) {
        trace!("event: {:?}", event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn connection_for_peer(&self, peer: PeerId) -> Option<Connection> {
        let state = self.lock_state();
        let id = state.identity_map.lookup_peer(peer)?;
        state.connections.get(&id).cloned()
    }

    fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.lock_state().connections.get(&id).cloned()
    }

    fn handle_notifications(&self) {
        loop {
            let Some(notification) = self.notifications.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .as_mut()
                .and_then(|subscription| subscription.try_recv())
            else {
                break;
            };

            match notification {
                TransportNotification::SessionRequest { peer } => {
                    // admission is decided on CONNECT, the raw session is always accepted
                    debug!(?peer, "accepting session request");
                    self.runtime.accept_session(peer);
                }
                TransportNotification::SessionFailed { peer, reason } => {
                    match self.connection_for_peer(peer) {
                        Some(connection) => {
                            connection.shared().on_session_failed(reason);
                        }
                        None => {
                            debug!(?peer, code = reason.code(), "session failed for a peer without connection: {}", reason);
                        }
                    }
                }
            }
        }
    }

    fn admit(&self, peer: PeerId) {
        let mut handshake = Handshake::new(Role::Responder, peer);
        if handshake.on_control(ControlMessage::Connect, self.sink.as_ref()) != HandshakeOutcome::AdmissionRequested {
            return;
        }

        let mut state = self.lock_state();
        // checked under the state lock, so that stop() sees every connection admitted before
        if self.is_stopped() {
            debug!(?peer, "listener is stopped - ignoring CONNECT");
            return;
        }
        if state.identity_map.lookup_peer(peer).is_some() {
            return;
        }

        if state.identity_map.is_full() {
            drop(state);
            warn!(?peer, max_connections = self.options.max_connections, "server full - rejecting connection");
            handshake.reject(self.sink.as_ref());
            self.send_event(ListenerEvent::Rejected { peer });
            return;
        }

        if handshake.admit(self.sink.as_ref()) != HandshakeOutcome::Established {
            warn!(?peer, "could not send ACCEPT");
            return;
        }

        let id = state.allocate_id();
        if let Err(e) = state.identity_map.insert(peer, id) {
            // capacity and id uniqueness were checked under the same lock
            warn!(?peer, ?id, "inconsistent identity map - dropping connection: {}", e);
            return;
        }

        let owner: Weak<dyn ConnectionOwner> = self.myself.clone();
        let shared = ConnectionShared::new(Some(id), handshake, self.runtime.clone(), self.options.clone(), self.sink.clone(), Some(owner));
        let connection = Connection::new(shared, None);
        state.connections.insert(id, connection.clone());

        if let Some(accepted) = &state.accepted {
            // the receiver lives as long as the listener
            let _ = accepted.send(connection);
        }
        drop(state);

        info!(?peer, ?id, "connection established");
        self.send_event(ListenerEvent::Connected { id, peer });
    }
}

impl ConnectionOwner for ListenerInner {
    fn on_closed(&self, connection: &ConnectionShared, reason: CloseReason) {
        let Some(id) = connection.id() else {
            return;
        };

        let removed = {
            let mut state = self.lock_state();
            state.connections.remove(&id);
            state.identity_map.remove_id(id)
        };

        if let Some(peer) = removed {
            info!(?peer, ?id, %reason, "connection closed");
            self.send_event(ListenerEvent::Disconnected { id, peer, reason });
        }
    }
}

impl PacketRouter for ListenerInner {
    fn on_control(&self, peer: PeerId, msg: ControlMessage) {
        if let Some(connection) = self.connection_for_peer(peer) {
            connection.shared().on_control(msg);
            return;
        }

        match msg {
            ControlMessage::Connect => self.admit(peer),
            msg => debug!(?peer, ?msg, "control message from a peer without connection - ignoring"),
        }
    }

    fn route_data(&self, peer: PeerId, channel: u8, payload: Bytes) -> bool {
        match self.connection_for_peer(peer) {
            Some(connection) => connection.shared().deliver(channel, payload),
            None => false,
        }
    }

    fn is_closed(&self) -> bool {
        self.is_stopped()
    }
}

impl Pump for ListenerInner {
    fn pump(&self) -> PollStats {
        if self.is_stopped() {
            return PollStats::default();
        }
        self.handle_notifications();
        self.runtime.poll()
    }

    fn is_finished(&self) -> bool {
        self.is_stopped()
    }
}


/// The server side. Connections are established in the background by a driver task, and
///  handed out through [Listener::accept_next].
///
/// Every established connection is queued for [Listener::accept_next] until it is accepted
///  or the listener stops, so applications must keep accepting even if they track
///  connections through [Listener::subscribe].
///
/// Stopping the listener (explicitly or by dropping it) disconnects all its connections.
pub struct Listener {
    inner: Arc<ListenerInner>,
    accepted: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
    driver: DriverHandle,
    route: Mutex<Option<RouteRegistration>>,
}
impl Listener {
    /// Starts listening on an initialized transport runtime. This must be called from within a
    ///  tokio runtime since it spawns the listener's driver task.
    pub fn listen(runtime: Arc<TransportRuntime>, options: ConnectionOptions) -> anyhow::Result<Listener> {
        options.validate()?;
        if !runtime.is_initialized() {
            bail!("transport runtime must be initialized before listening");
        }

        runtime.allow_relay(options.allow_relay);

        let options = Arc::new(options);
        let (accept_sender, accept_receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new_cyclic(|myself| ListenerInner {
            myself: myself.clone(),
            runtime: runtime.clone(),
            options: options.clone(),
            sink: Arc::new(TransportControlSink::new(runtime.clone(), &options)),
            state: Mutex::new(ListenerState {
                identity_map: IdentityMap::new(options.max_connections),
                connections: Default::default(),
                next_id: 1,
                accepted: Some(accept_sender),
            }),
            notifications: Mutex::new(Some(runtime.subscribe())),
            events,
            stopped: AtomicBool::new(false),
        });

        let router: Weak<dyn PacketRouter> = { let w: Weak<ListenerInner> = Arc::downgrade(&inner); w };
        let route = runtime.demux().register_listener(router, &options)?;

        let span = info_span!("listener", local_peer = ?runtime.local_peer());
        let driver = DriverHandle::spawn(inner.clone(), options.pump_interval, span)?;

        info!(local_peer = ?runtime.local_peer(), max_connections = options.max_connections, channels = options.channels.len(), "listening");

        Ok(Listener {
            inner,
            accepted: tokio::sync::Mutex::new(accept_receiver),
            driver,
            route: Mutex::new(Some(route)),
        })
    }

    /// Waits for the next connection that completed the handshake. Connections that were
    ///  closed again before being accepted are skipped. Returns `None` once the listener is
    ///  stopped.
    pub async fn accept_next(&self) -> Option<Connection> {
        let mut accepted = self.accepted.lock().await;
        loop {
            let connection = accepted.recv().await?;
            if self.inner.is_stopped() {
                return None;
            }
            if connection.is_connected() {
                return Some(connection);
            }
            debug!(?connection, "connection closed before it was accepted - skipping");
        }
    }

    /// A single poll cycle on the listener's transport runtime. The listener's driver calls
    ///  this regularly, but it can also be called from an application's own update loop to
    ///  reduce latency. If another poll cycle is running on the runtime at the same time, this
    ///  call reads nothing.
    pub fn pump(&self) -> PollStats {
        self.inner.pump()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.inner.events.subscribe()
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.runtime.local_peer()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.connection(id)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut result = self.inner.lock_state().identity_map.ids().collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock_state().identity_map.len()
    }

    /// The peer behind a connection id
    pub fn peer_of(&self, id: ConnectionId) -> Option<PeerId> {
        self.inner.lock_state().identity_map.lookup_id(id)
    }

    pub fn id_of(&self, peer: PeerId) -> Option<ConnectionId> {
        self.inner.lock_state().identity_map.lookup_peer(peer)
    }

    /// Administrative disconnect. Returns `false` if there is no connection with the id.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.inner.connection(id) {
            Some(connection) => {
                connection.disconnect();
                true
            }
            None => {
                warn!(?id, "disconnect: no connection with this id");
                false
            }
        }
    }

    pub fn send_to(&self, id: ConnectionId, payload: &[u8], channel: u8) -> Result<(), ConnectionError> {
        match self.inner.connection(id) {
            Some(connection) => connection.send(payload, channel),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Sends the same payload to several connections. Every connection is attempted, and the
    ///  result is `true` only if all sends succeeded.
    pub fn broadcast(&self, ids: &[ConnectionId], payload: &[u8], channel: u8) -> bool {
        let mut result = true;
        for &id in ids {
            if let Err(e) = self.send_to(id, payload, channel) {
                warn!(?id, channel, "broadcast: sending failed: {}", e);
                result = false;
            }
        }
        result
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Disconnects all connections and stops the driver. Pending and future calls to
    ///  [Listener::accept_next] return `None`.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(local_peer = ?self.local_peer(), "stopping listener");

        self.driver.stop();
        self.route.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.notifications.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let (connections, accepted) = {
            let mut state = self.inner.lock_state();
            (state.connections.values().cloned().collect::<Vec<_>>(), state.accepted.take())
        };
        for connection in connections {
            connection.shared().close(CloseReason::ListenerStopped);
        }
        drop(accepted);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use crate::client::connect_to;
    use crate::error::ConnectError;
    use crate::handshake::HandshakeState;
    use crate::test_util::{memory_runtime, settle, test_options, test_peer};
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::notification::SessionFailure;
    use super::*;

    const SERVER: PeerId = PeerId(1);

    fn server(network: &MemoryNetwork, max_connections: usize) -> Listener {
        Listener::listen(memory_runtime(network, SERVER), test_options(max_connections)).unwrap()
    }

    async fn client(network: &MemoryNetwork, peer: u64) -> Result<Connection, ConnectError> {
        connect_to(memory_runtime(network, test_peer(peer)), SERVER, test_options(1)).await
    }

    fn received_events(events: &mut broadcast::Receiver<ListenerEvent>) -> Vec<ListenerEvent> {
        let mut result = Vec::new();
        while let Ok(evt) = events.try_recv() {
            result.push(evt);
        }
        result
    }

    #[tokio::test]
    async fn test_listen_requires_initialized_runtime() {
        let network = MemoryNetwork::new();
        let runtime = TransportRuntime::new(network.add_peer(SERVER));
        assert!(Listener::listen(runtime, test_options(1)).is_err());
    }

    #[tokio::test]
    async fn test_listen_validates_options() {
        let network = MemoryNetwork::new();
        assert!(Listener::listen(memory_runtime(&network, SERVER), test_options(0)).is_err());
    }

    #[tokio::test]
    async fn test_listen_applies_relay_setting() {
        let network = MemoryNetwork::new();
        let _listener = Listener::listen(memory_runtime(&network, SERVER), test_options(1)).unwrap();
        assert!(network.is_relay_allowed(SERVER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_with_free_capacity() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);
        let mut events = listener.subscribe();

        let client_connection = client(&network, 2).await.unwrap();
        assert!(client_connection.is_connected());
        assert_eq!(client_connection.id(), None);

        let server_connection = listener.accept_next().await.unwrap();
        assert_eq!(server_connection.remote_peer(), test_peer(2));
        assert_eq!(server_connection.id(), Some(ConnectionId(1)));

        assert_eq!(listener.connection_count(), 1);
        assert_eq!(listener.peer_of(ConnectionId(1)), Some(test_peer(2)));
        assert_eq!(received_events(&mut events), vec![ListenerEvent::Connected { id: ConnectionId(1), peer: test_peer(2) }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_when_full() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);

        let _first = client(&network, 2).await.unwrap();
        let mut events = listener.subscribe();

        assert_eq!(client(&network, 3).await.unwrap_err(), ConnectError::ServerFull);

        assert_eq!(listener.connection_count(), 1);
        assert_eq!(listener.id_of(test_peer(3)), None);
        assert_eq!(listener.id_of(test_peer(2)), Some(ConnectionId(1)));
        assert_eq!(received_events(&mut events), vec![ListenerEvent::Rejected { peer: test_peer(3) }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_connect_is_idempotent() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 4);
        let mut events = listener.subscribe();
        let _client_runtime = memory_runtime(&network, test_peer(2));

        let connect = [ControlMessage::Connect.id()];
        let control = listener.options().control_channel();
        network.inject(test_peer(2), SERVER, control, &connect);
        network.inject(test_peer(2), SERVER, control, &connect);
        listener.pump();
        network.inject(test_peer(2), SERVER, control, &connect);
        listener.pump();

        assert_eq!(listener.connection_count(), 1);
        assert_eq!(received_events(&mut events), vec![ListenerEvent::Connected { id: ConnectionId(1), peer: test_peer(2) }]);

        let accepts = network.take_sent(SERVER).into_iter()
            .filter(|p| p.to == test_peer(2) && p.channel == control && p.payload.as_ref() == [ControlMessage::Accept.id()])
            .count();
        assert_eq!(accepts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_is_received_in_order() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);

        let client_connection = client(&network, 2).await.unwrap();
        let server_connection = listener.accept_next().await.unwrap();

        for payload in [&b"a"[..], b"b", b"c"] {
            client_connection.send(payload, 0).unwrap();
        }

        for expected in [&b"a"[..], b"b", b"c"] {
            let msg = server_connection.receive().await.unwrap();
            assert_eq!(msg.channel, 0);
            assert_eq!(msg.payload.as_ref(), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_on_several_channels_keeps_per_channel_order() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);

        let client_connection = client(&network, 2).await.unwrap();
        let server_connection = listener.accept_next().await.unwrap();

        for i in 0..10u8 {
            client_connection.send(&[i], i % 2).unwrap();
        }
        settle(listener.options()).await;

        let mut per_channel: [Vec<u8>; 2] = Default::default();
        while let Ok(Some(msg)) = server_connection.try_receive() {
            per_channel[msg.channel as usize].push(msg.payload[0]);
        }
        assert_eq!(per_channel[0], vec![0, 2, 4, 6, 8]);
        assert_eq!(per_channel[1], vec![1, 3, 5, 7, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_disconnect_closes_server_side() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);
        let mut events = listener.subscribe();

        let client_connection = client(&network, 2).await.unwrap();
        let server_connection = listener.accept_next().await.unwrap();

        let receiver = {
            let server_connection = server_connection.clone();
            tokio::spawn(async move { server_connection.receive().await })
        };
        settle(listener.options()).await;

        client_connection.disconnect();
        assert_eq!(client_connection.close_reason(), Some(CloseReason::LocalDisconnect));

        tokio::time::sleep(listener.options().pump_interval * 2).await;
        assert_eq!(receiver.await.unwrap(), Err(ConnectionError::ConnectionClosed));

        assert_eq!(listener.connection_count(), 0);
        assert_eq!(server_connection.close_reason(), Some(CloseReason::RemoteDisconnect));
        assert_eq!(received_events(&mut events), vec![
            ListenerEvent::Connected { id: ConnectionId(1), peer: test_peer(2) },
            ListenerEvent::Disconnected { id: ConnectionId(1), peer: test_peer(2), reason: CloseReason::RemoteDisconnect },
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_administrative_disconnect() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);

        let client_connection = client(&network, 2).await.unwrap();
        let id = listener.accept_next().await.unwrap().id().unwrap();

        assert!(listener.disconnect(id));
        assert!(!listener.disconnect(id));
        assert!(!listener.disconnect(ConnectionId(99)));
        assert_eq!(listener.connection_count(), 0);

        assert_eq!(client_connection.closed().await, CloseReason::RemoteDisconnect);
        assert_eq!(client_connection.send(b"x", 0), Err(ConnectionError::NotConnected));
        assert_eq!(client_connection.receive().await, Err(ConnectionError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_is_freed_by_disconnect() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);

        let first = client(&network, 2).await.unwrap();
        first.disconnect();
        settle(listener.options()).await;
        assert_eq!(listener.connection_count(), 0);

        let second = client(&network, 3).await.unwrap();
        assert!(second.is_connected());
        assert_eq!(listener.id_of(test_peer(3)), Some(ConnectionId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_failure_is_isolated() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 2);

        let _client_a = client(&network, 2).await.unwrap();
        let client_b = client(&network, 3).await.unwrap();
        let server_a = listener.accept_next().await.unwrap();
        let server_b = listener.accept_next().await.unwrap();

        client_b.send(b"for b", 0).unwrap();
        settle(listener.options()).await;
        assert_eq!(server_b.num_pending(), 1);

        network.fail_session(SERVER, test_peer(2), SessionFailure::Timeout);
        settle(listener.options()).await;

        assert_eq!(server_a.close_reason(), Some(CloseReason::TransportFailure(SessionFailure::Timeout)));
        assert_eq!(listener.id_of(test_peer(2)), None);

        assert!(server_b.is_connected());
        assert_eq!(server_b.num_pending(), 1);
        assert_eq!(listener.id_of(test_peer(3)), Some(server_b.id().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_from_unknown_peer_is_dropped() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);

        network.inject(test_peer(7), SERVER, 0, b"who am i");
        let stats = listener.pump();
        assert_eq!(stats.dropped, 1);
        assert_eq!(listener.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_and_broadcast() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 2);

        let client_a = client(&network, 2).await.unwrap();
        let client_b = client(&network, 3).await.unwrap();
        let ids = listener.connection_ids();
        assert_eq!(ids, vec![ConnectionId(1), ConnectionId(2)]);

        listener.send_to(ids[0], b"only a", 0).unwrap();
        assert!(listener.broadcast(&ids, b"everyone", 0));
        assert!(!listener.broadcast(&[ids[1], ConnectionId(42)], b"partly", 0));
        assert_eq!(listener.send_to(ConnectionId(42), b"x", 0), Err(ConnectionError::NotConnected));

        settle(listener.options()).await;

        let payloads = |connection: &Connection| {
            let mut result = Vec::new();
            while let Ok(Some(msg)) = connection.try_receive() {
                result.push(msg.payload);
            }
            result
        };
        assert_eq!(payloads(&client_a), vec![Bytes::from_static(b"only a"), Bytes::from_static(b"everyone")]);
        assert_eq!(payloads(&client_b), vec![Bytes::from_static(b"everyone"), Bytes::from_static(b"partly")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disconnects_everyone() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 2);
        let mut events = listener.subscribe();

        let client_a = client(&network, 2).await.unwrap();
        let server_a = listener.accept_next().await.unwrap();

        listener.stop();
        listener.stop();

        assert!(listener.is_stopped());
        assert_eq!(listener.connection_count(), 0);
        assert_eq!(server_a.state(), HandshakeState::Disconnected);
        assert_eq!(server_a.close_reason(), Some(CloseReason::ListenerStopped));
        assert_eq!(listener.accept_next().await.map(|c| c.id()), None);

        assert_eq!(client_a.closed().await, CloseReason::RemoteDisconnect);
        assert_eq!(received_events(&mut events), vec![
            ListenerEvent::Connected { id: ConnectionId(1), peer: test_peer(2) },
            ListenerEvent::Disconnected { id: ConnectionId(1), peer: test_peer(2), reason: CloseReason::ListenerStopped },
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_listener() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 1);

        let client_connection = client(&network, 2).await.unwrap();
        drop(listener);

        assert_eq!(client_connection.closed().await, CloseReason::RemoteDisconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_accept_is_woken_by_stop() {
        let network = MemoryNetwork::new();
        let listener = Arc::new(server(&network, 1));

        let acceptor = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept_next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.stop();
        assert!(acceptor.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_skips_connections_closed_before_accept() {
        let network = MemoryNetwork::new();
        let listener = server(&network, 2);

        let early = client(&network, 2).await.unwrap();
        early.disconnect();
        settle(listener.options()).await;
        assert_eq!(listener.connection_count(), 0);

        let _late = client(&network, 3).await.unwrap();
        let accepted = listener.accept_next().await.unwrap();
        assert_eq!(accepted.remote_peer(), test_peer(3));
        assert!(accepted.is_connected());
    }

    #[tokio::test]
    async fn test_stop_releases_notification_subscription() {
        let network = MemoryNetwork::new();
        let runtime = memory_runtime(&network, SERVER);

        let listener = Listener::listen(runtime.clone(), test_options(1)).unwrap();
        assert_eq!(runtime.notification_hub().num_subscribers(), 1);

        listener.stop();
        assert_eq!(runtime.notification_hub().num_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_one_listener_per_runtime() {
        let network = MemoryNetwork::new();
        let runtime = memory_runtime(&network, SERVER);

        let first = Listener::listen(runtime.clone(), test_options(1)).unwrap();
        assert!(Listener::listen(runtime.clone(), test_options(1)).is_err());

        first.stop();
        assert!(Listener::listen(runtime, test_options(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_listener_admits_nobody() {
        let network = MemoryNetwork::new();
        let runtime = memory_runtime(&network, SERVER);
        let listener = Listener::listen(runtime.clone(), test_options(1)).unwrap();
        listener.stop();

        let _client_runtime = memory_runtime(&network, test_peer(2));
        network.inject(test_peer(2), SERVER, listener.options().control_channel(), &[ControlMessage::Connect.id()]);
        listener.pump();
        runtime.poll();

        assert_eq!(listener.connection_count(), 0);
        assert!(network.take_sent(SERVER).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_pumping_keeps_order() {
        const NUM_MESSAGES: u16 = 2000;

        let network = MemoryNetwork::new();
        let listener = server(&network, 1);
        let client_connection = client(&network, 2).await.unwrap();
        let server_connection = listener.accept_next().await.unwrap();

        for i in 0..NUM_MESSAGES {
            client_connection.send(&i.to_be_bytes(), 0).unwrap();
        }

        // application threads pumping while the driver does the same
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        listener.pump();
                    }
                });
            }
        });

        for expected in 0..NUM_MESSAGES {
            let msg = tokio::time::timeout(Duration::from_secs(5), server_connection.receive()).await
                .unwrap()
                .unwrap();
            assert_eq!(msg.payload.as_ref(), expected.to_be_bytes());
        }
    }
}
