//! A logical connection with a single remote peer: the handle a game networking framework
//!  sends and receives on.

pub mod inbound_queue;

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::client::ClientDriver;
use crate::config::ConnectionOptions;
use crate::error::ConnectionError;
use crate::handshake::control_messages::ControlMessage;
use crate::handshake::{CloseReason, ControlSink, Handshake, HandshakeOutcome, HandshakeState};
use crate::identity_map::ConnectionId;
use crate::transport::notification::SessionFailure;
use crate::transport::runtime::TransportRuntime;
use crate::transport::PeerId;

pub use inbound_queue::{InboundQueue, ReceivedMessage};


/// Whoever keeps track of a connection and must be told when it ends - on the server side,
///  that is the listener with its identity map
pub(crate) trait ConnectionOwner: Send + Sync {
    fn on_closed(&self, connection: &ConnectionShared, reason: CloseReason);
}

pub(crate) struct ConnectionShared {
    id: Option<ConnectionId>,
    remote_peer: PeerId,
    runtime: Arc<TransportRuntime>,
    options: Arc<ConnectionOptions>,
    sink: Arc<dyn ControlSink>,
    handshake: Mutex<Handshake>,
    status: watch::Sender<HandshakeState>,
    inbound: InboundQueue,
    owner: Option<Weak<dyn ConnectionOwner>>,
}
impl ConnectionShared {
    pub fn new(
        id: Option<ConnectionId>,
        handshake: Handshake,
        runtime: Arc<TransportRuntime>,
        options: Arc<ConnectionOptions>,
        sink: Arc<dyn ControlSink>,
        owner: Option<Weak<dyn ConnectionOwner>>,
    ) -> Arc<ConnectionShared> {
        let (status, _) = watch::channel(handshake.state());
        Arc::new(ConnectionShared {
            id,
            remote_peer: handshake.remote(),
            runtime,
            options,
            sink,
            handshake: Mutex::new(handshake),
            status,
            inbound: InboundQueue::new(),
            owner,
        })
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn state(&self) -> HandshakeState {
        *self.status.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HandshakeState> {
        self.status.subscribe()
    }

    pub fn initiate(&self) -> HandshakeOutcome {
        self.step(|handshake, sink| handshake.initiate(sink))
    }

    pub fn on_control(&self, msg: ControlMessage) -> HandshakeOutcome {
        self.step(|handshake, sink| handshake.on_control(msg, sink))
    }

    pub fn on_timeout(&self) -> HandshakeOutcome {
        self.step(|handshake, sink| handshake.on_timeout(sink))
    }

    pub fn on_session_failed(&self, reason: SessionFailure) -> HandshakeOutcome {
        self.step(|handshake, sink| handshake.on_session_failed(reason, sink))
    }

    pub fn close(&self, reason: CloseReason) -> HandshakeOutcome {
        self.step(|handshake, sink| handshake.disconnect(reason, sink))
    }

    /// Queues a received data packet, returning `false` if it was dropped because the
    ///  connection is not (or no longer) established
    pub fn deliver(&self, channel: u8, payload: Bytes) -> bool {
        if self.state() != HandshakeState::Connected {
            trace!(remote = ?self.remote_peer, channel, "data on a connection that is not established - dropping");
            return false;
        }
        self.inbound.push(ReceivedMessage { channel, payload })
    }

    /// Runs a handshake step and applies its outcome. The handshake lock is released before
    ///  the owner is notified, so the owner may take its own locks.
    fn step(&self, f: impl FnOnce(&mut Handshake, &dyn ControlSink) -> HandshakeOutcome) -> HandshakeOutcome {
        let outcome = {
            let mut handshake = self.lock_handshake();
            let outcome = f(&mut handshake, self.sink.as_ref());
            self.status.send_replace(handshake.state());
            outcome
        };

        if let HandshakeOutcome::Closed(reason) = outcome {
            self.inbound.close();
            if let Some(owner) = self.owner.as_ref().and_then(|o| o.upgrade()) {
                owner.on_closed(self, reason);
            }
        }
        outcome
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock_handshake().close_reason()
    }

    fn lock_handshake(&self) -> MutexGuard<'_, Handshake> {
        self.handshake.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}


/// Handle to a logical connection. Cloning is cheap, and all clones refer to the same
///  connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
    /// client connections keep their driver running for as long as there is a handle
    _client_driver: Option<Arc<ClientDriver>>,
}
impl Connection {
    pub(crate) fn new(shared: Arc<ConnectionShared>, client_driver: Option<Arc<ClientDriver>>) -> Connection {
        Connection {
            shared,
            _client_driver: client_driver,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    /// Sends a packet on one of the configured data channels, with the channel's configured
    ///  reliability. `Ok` means the raw transport accepted the packet, not that it was delivered.
    pub fn send(&self, payload: &[u8], channel: u8) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let reliability = self.shared.options.reliability(channel)
            .ok_or(ConnectionError::InvalidChannel(channel))?;

        if self.shared.runtime.send(self.shared.remote_peer, payload, channel, reliability) {
            Ok(())
        }
        else {
            debug!(remote = ?self.shared.remote_peer, channel, len = payload.len(), "transport refused packet");
            Err(ConnectionError::SendFailed)
        }
    }

    /// Sends on the first data channel
    pub fn send_default(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        self.send(payload, 0)
    }

    /// Waits for the next received message. After the connection closed, messages that were
    ///  received before are still returned, and then [ConnectionError::ConnectionClosed].
    pub async fn receive(&self) -> Result<ReceivedMessage, ConnectionError> {
        self.shared.inbound.pop().await
    }

    pub fn try_receive(&self) -> Result<Option<ReceivedMessage>, ConnectionError> {
        self.shared.inbound.try_pop()
    }

    /// Closes the connection, notifying the remote peer. Calling this on a closed connection
    ///  has no effect.
    pub fn disconnect(&self) {
        self.shared.close(CloseReason::LocalDisconnect);
    }

    pub fn local_peer(&self) -> PeerId {
        self.shared.runtime.local_peer()
    }

    pub fn remote_peer(&self) -> PeerId {
        self.shared.remote_peer
    }

    /// The id assigned by the listener - `None` on the connecting side
    pub fn id(&self) -> Option<ConnectionId> {
        self.shared.id
    }

    pub fn state(&self) -> HandshakeState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == HandshakeState::Connected
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    pub fn num_pending(&self) -> usize {
        self.shared.inbound.len()
    }

    /// Waits until the connection is closed, returning the reason
    pub async fn closed(&self) -> CloseReason {
        let mut status = self.shared.subscribe_state();
        // the sender lives in the shared state we hold on to, so this can not fail
        let _ = status.wait_for(|s| *s == HandshakeState::Disconnected).await;
        self.close_reason()
            .unwrap_or(CloseReason::LocalDisconnect)
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote_peer", &self.shared.remote_peer)
            .field("state", &self.state())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use mockall::predicate::eq;
    use crate::config::Reliability;
    use crate::handshake::{MockControlSink, Role};
    use crate::test_util::{memory_runtime, test_peer};
    use crate::transport::memory::MemoryNetwork;
    use super::*;

    struct CountingOwner {
        closed: AtomicUsize,
    }
    impl ConnectionOwner for CountingOwner {
        fn on_closed(&self, connection: &ConnectionShared, reason: CloseReason) {
            assert_eq!(connection.state(), HandshakeState::Disconnected);
            assert_eq!(reason, CloseReason::LocalDisconnect);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lenient_sink() -> Arc<MockControlSink> {
        let mut sink = MockControlSink::new();
        sink.expect_send_control().return_const(true);
        sink.expect_accept_session().return_const(true);
        sink.expect_close_session().return_const(());
        Arc::new(sink)
    }

    fn server_side_connection(network: &MemoryNetwork, sink: Arc<dyn ControlSink>, owner: Option<Weak<dyn ConnectionOwner>>) -> Connection {
        let runtime = memory_runtime(network, test_peer(1));
        let mut handshake = Handshake::new(Role::Responder, test_peer(2));
        handshake.on_control(ControlMessage::Connect, sink.as_ref());
        handshake.admit(sink.as_ref());

        let shared = ConnectionShared::new(Some(ConnectionId(1)), handshake, runtime, Arc::new(ConnectionOptions::new()), sink, owner);
        Connection::new(shared, None)
    }

    #[test]
    fn test_send_uses_channel_reliability() {
        let network = MemoryNetwork::new();
        let _remote = network.add_peer(test_peer(2));
        let connection = server_side_connection(&network, lenient_sink(), None);

        connection.send(b"reliable", 0).unwrap();
        connection.send(b"unreliable", 1).unwrap();
        connection.send_default(b"default").unwrap();

        let sent = network.take_sent(test_peer(1));
        assert_eq!(sent.iter().map(|p| (p.channel, p.reliability)).collect::<Vec<_>>(), vec![
            (0, Reliability::Reliable),
            (1, Reliability::Unreliable),
            (0, Reliability::Reliable),
        ]);
    }

    #[test]
    fn test_send_validates_channel() {
        let network = MemoryNetwork::new();
        let connection = server_side_connection(&network, lenient_sink(), None);

        // the control channel is not a data channel
        assert_eq!(connection.send(b"x", 2), Err(ConnectionError::InvalidChannel(2)));
        assert_eq!(connection.send(b"x", 200), Err(ConnectionError::InvalidChannel(200)));
    }

    #[test]
    fn test_send_when_not_connected() {
        let network = MemoryNetwork::new();
        let connection = server_side_connection(&network, lenient_sink(), None);
        connection.disconnect();

        assert_eq!(connection.send(b"x", 0), Err(ConnectionError::NotConnected));
        assert_eq!(connection.send(b"x", 200), Err(ConnectionError::NotConnected));
    }

    #[test]
    fn test_send_refused_by_transport() {
        let network = MemoryNetwork::with_max_packet_size(4);
        let connection = server_side_connection(&network, lenient_sink(), None);
        assert_eq!(connection.send(b"too long", 0), Err(ConnectionError::SendFailed));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_notifies_owner_once() {
        let network = MemoryNetwork::new();
        let owner = Arc::new(CountingOwner { closed: AtomicUsize::new(0) });
        let weak_owner: Weak<dyn ConnectionOwner> = Arc::downgrade(&owner) as Weak<dyn ConnectionOwner>;

        let mut sink = MockControlSink::new();
        sink.expect_accept_session().return_const(true);
        sink.expect_send_control()
            .with(eq(test_peer(2)), eq(ControlMessage::Accept))
            .return_const(true);
        sink.expect_send_control()
            .with(eq(test_peer(2)), eq(ControlMessage::Disconnect))
            .times(1)
            .return_const(true);
        sink.expect_close_session()
            .with(eq(test_peer(2)), eq(true))
            .times(1)
            .return_const(());

        let connection = server_side_connection(&network, Arc::new(sink), Some(weak_owner));
        connection.disconnect();
        connection.clone().disconnect();

        assert_eq!(owner.closed.load(Ordering::SeqCst), 1);
        assert_eq!(connection.close_reason(), Some(CloseReason::LocalDisconnect));
        assert_eq!(connection.closed().await, CloseReason::LocalDisconnect);
    }

    #[tokio::test]
    async fn test_deliver_then_close_drains() {
        let network = MemoryNetwork::new();
        let connection = server_side_connection(&network, lenient_sink(), None);

        assert!(connection.shared().deliver(1, Bytes::from_static(b"first")));
        connection.shared().on_control(ControlMessage::Disconnect);
        assert!(!connection.shared().deliver(1, Bytes::from_static(b"second")));

        assert_eq!(connection.receive().await.unwrap().payload, Bytes::from_static(b"first"));
        assert_eq!(connection.receive().await, Err(ConnectionError::ConnectionClosed));
        assert_eq!(connection.close_reason(), Some(CloseReason::RemoteDisconnect));
    }

    #[test]
    fn test_accessors() {
        let network = MemoryNetwork::new();
        let connection = server_side_connection(&network, lenient_sink(), None);

        assert_eq!(connection.local_peer(), test_peer(1));
        assert_eq!(connection.remote_peer(), test_peer(2));
        assert_eq!(connection.id(), Some(ConnectionId(1)));
        assert!(connection.is_connected());
        assert_eq!(connection.close_reason(), None);
        assert_eq!(connection.try_receive(), Ok(None));
    }
}
