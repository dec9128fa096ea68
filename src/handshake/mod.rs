//! The connection handshake. Both sides of a connection run the same state machine
//!  ([state_machine::Handshake]), parameterized by their [Role]. All effects on the outside
//!  world go through a [ControlSink], so the state machine itself is plain synchronous code.

pub mod control_messages;
pub mod control_sink;
pub mod state_machine;

use std::fmt::{Display, Formatter};
#[cfg(test)] use mockall::automock;

use crate::handshake::control_messages::ControlMessage;
use crate::transport::notification::SessionFailure;
use crate::transport::PeerId;

pub use state_machine::Handshake;


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// the client side, sending CONNECT
    Initiator,
    /// the server side, answering CONNECT with ACCEPT or REJECT_TOO_MANY
    Responder,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeState {
    Idle,
    /// CONNECT was sent, waiting for the server's answer - initiator only
    Connecting,
    Connected,
    /// terminal
    Disconnected,
}

/// Why a connection (or connection attempt) ended
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// the server answered REJECT_TOO_MANY
    ServerFull,
    /// the server answered CONNECT with DISCONNECT
    Refused,
    /// no answer from the server within the connect timeout
    Timeout,
    /// the transport refused to send a handshake message
    SendFailed,
    TransportFailure(SessionFailure),
    /// the remote side sent DISCONNECT
    RemoteDisconnect,
    /// closed through this side's API
    LocalDisconnect,
    ListenerStopped,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::ServerFull => write!(f, "server full"),
            CloseReason::Refused => write!(f, "refused by server"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::SendFailed => write!(f, "send failed"),
            CloseReason::TransportFailure(failure) => write!(f, "transport failure ({}): {}", failure.code(), failure),
            CloseReason::RemoteDisconnect => write!(f, "disconnected by remote"),
            CloseReason::LocalDisconnect => write!(f, "disconnected locally"),
            CloseReason::ListenerStopped => write!(f, "listener stopped"),
        }
    }
}

/// What a handshake step resulted in, for the caller to act upon (register or unregister the
///  connection, resolve a pending connect, emit events)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandshakeOutcome {
    Unchanged,
    Established,
    /// a responder received CONNECT: the caller decides between [Handshake::admit] and
    ///  [Handshake::reject] based on its capacity
    AdmissionRequested,
    Closed(CloseReason),
}


/// The side effects of the handshake state machine
#[cfg_attr(test, automock)]
pub trait ControlSink: Send + Sync {
    /// Sends a control message reliably on the control channel. `false` if the transport
    ///  refused it.
    fn send_control(&self, to: PeerId, msg: ControlMessage) -> bool;

    fn accept_session(&self, peer: PeerId) -> bool;

    /// Releases the raw session with a peer. `after_disconnect` is set if a DISCONNECT was
    ///  just sent and should be given a chance to go out before the session is closed.
    fn close_session(&self, peer: PeerId, after_disconnect: bool);
}
