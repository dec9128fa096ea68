//! The connecting side.

use std::sync::{Arc, Mutex, Weak};
use bytes::Bytes;
use tokio::time;
use tracing::{debug, error, info, trace, warn, debug_span};

use crate::config::ConnectionOptions;
use crate::connection::{Connection, ConnectionShared};
use crate::demux::{PacketRouter, PollStats, RouteError, RouteRegistration};
use crate::driver::{DriverHandle, Pump};
use crate::error::ConnectError;
use crate::handshake::control_messages::ControlMessage;
use crate::handshake::control_sink::TransportControlSink;
use crate::handshake::{CloseReason, Handshake, HandshakeOutcome, HandshakeState, Role};
use crate::transport::notification::{Subscription, TransportNotification};
use crate::transport::runtime::TransportRuntime;
use crate::transport::PeerId;


/// Everything a client connection's driver works on. Only the server it connects to is
///  talked to - session requests, control messages and data from other peers are ignored.
struct ClientLink {
    server: PeerId,
    runtime: Arc<TransportRuntime>,
    connection: Arc<ConnectionShared>,
    notifications: Mutex<Subscription>,
}
impl ClientLink {
    fn handle_notifications(&self) {
        loop {
            let Some(notification) = self.notifications.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .try_recv()
            else {
                break;
            };

            match notification {
                TransportNotification::SessionRequest { peer } if peer == self.server => {
                    debug!(?peer, "accepting session request from server");
                    self.runtime.accept_session(peer);
                }
                TransportNotification::SessionRequest { peer } => {
                    debug!(?peer, "session request from a peer other than the server - ignoring");
                }
                TransportNotification::SessionFailed { peer, reason } if peer == self.server => {
                    self.connection.on_session_failed(reason);
                }
                TransportNotification::SessionFailed { peer, reason } => {
                    trace!(?peer, code = reason.code(), "session failed for a peer other than the server: {}", reason);
                }
            }
        }
    }
}

impl PacketRouter for ClientLink {
    fn on_control(&self, peer: PeerId, msg: ControlMessage) {
        if peer != self.server {
            debug!(?peer, ?msg, "control message from a peer other than the server - ignoring");
            return;
        }
        self.connection.on_control(msg);
    }

    fn route_data(&self, peer: PeerId, channel: u8, payload: Bytes) -> bool {
        if peer != self.server {
            return false;
        }
        self.connection.deliver(channel, payload)
    }

    fn is_closed(&self) -> bool {
        self.connection.state() == HandshakeState::Disconnected
    }
}

impl Pump for ClientLink {
    fn pump(&self) -> PollStats {
        self.handle_notifications();
        self.runtime.poll()
    }

    fn is_finished(&self) -> bool {
        self.connection.state() == HandshakeState::Disconnected
    }
}


/// Shared by all handles of a client connection. When the last handle is dropped, the
///  connection is closed (sending DISCONNECT if it is still open), its driver stops and its
///  route is released.
pub(crate) struct ClientDriver {
    connection: Arc<ConnectionShared>,
    _driver: DriverHandle,
    _route: RouteRegistration,
}
impl Drop for ClientDriver {
    fn drop(&mut self) {
        if self.connection.state() != HandshakeState::Disconnected {
            debug!(server = ?self.connection.remote_peer(), "connection dropped - disconnecting");
        }
        self.connection.close(CloseReason::LocalDisconnect);
    }
}


/// Connects to a server peer that runs a [crate::listener::Listener], resolving once the
///  server accepted or rejected the connection, or the connect timeout expired. There is no
///  automatic retry.
///
/// The returned connection is driven by a spawned task for as long as a handle to it exists,
///  so this must be called from within a tokio runtime. Dropping the last handle disconnects.
///
/// A transport runtime can carry connections to several servers, but only one per server.
pub async fn connect_to(runtime: Arc<TransportRuntime>, server: PeerId, options: ConnectionOptions) -> Result<Connection, ConnectError> {
    if !runtime.is_initialized() {
        return Err(ConnectError::NotInitialized);
    }
    options.validate()
        .map_err(|e| ConnectError::InvalidOptions(e.to_string()))?;

    let options = Arc::new(options);
    let sink = Arc::new(TransportControlSink::new(runtime.clone(), &options));
    let connection = ConnectionShared::new(None, Handshake::new(Role::Initiator, server), runtime.clone(), options.clone(), sink, None);

    let link = Arc::new(ClientLink {
        server,
        runtime: runtime.clone(),
        connection: connection.clone(),
        notifications: Mutex::new(runtime.subscribe()),
    });

    let router: Weak<dyn PacketRouter> = { let w: Weak<ClientLink> = Arc::downgrade(&link); w };
    let route = runtime.demux().register_peer(server, router, &options)
        .map_err(|e| match e {
            RouteError::PeerTaken(_) => ConnectError::AlreadyConnected,
            e => ConnectError::InvalidOptions(e.to_string()),
        })?;

    runtime.allow_relay(options.allow_relay);
    // a session left over from an earlier connection would carry stale packets
    runtime.close_session(server);

    info!(?server, "connecting");
    if let HandshakeOutcome::Closed(reason) = connection.initiate() {
        return Err(ConnectError::from_close_reason(reason));
    }

    let span = debug_span!("client", local_peer = ?runtime.local_peer(), ?server);
    let driver = match DriverHandle::spawn(link, options.pump_interval, span) {
        Ok(driver) => driver,
        Err(e) => {
            error!("{}", e);
            connection.close(CloseReason::LocalDisconnect);
            return Err(ConnectError::NotInitialized);
        }
    };
    // from here on, abandoning the attempt disconnects
    let client_driver = Arc::new(ClientDriver {
        connection: connection.clone(),
        _driver: driver,
        _route: route,
    });

    let mut status = connection.subscribe_state();
    let waiting = time::timeout(options.connect_timeout, async {
        // the sender is owned by the connection, which outlives this
        let _ = status.wait_for(|s| *s != HandshakeState::Connecting).await;
    }).await;

    if waiting.is_err() {
        warn!(?server, timeout = ?options.connect_timeout, "no response from server");
        connection.on_timeout();
    }

    match connection.state() {
        HandshakeState::Connected => {
            info!(?server, "connected");
            Ok(Connection::new(connection, Some(client_driver)))
        }
        _ => {
            let reason = connection.close_reason()
                .unwrap_or(CloseReason::Refused);
            info!(?server, %reason, "connecting failed");
            Err(ConnectError::from_close_reason(reason))
        }
    }
}
