use tracing::{debug, trace, warn};

use crate::handshake::control_messages::ControlMessage;
use crate::handshake::{CloseReason, ControlSink, HandshakeOutcome, HandshakeState, Role};
use crate::transport::notification::SessionFailure;
use crate::transport::PeerId;


/// The handshake with a single remote peer.
///
/// ```ascii
///  initiator:  Idle --initiate--> Connecting --ACCEPT--> Connected --DISCONNECT--> Disconnected
///                                     |                                               ^
///                                     +-- REJECT_TOO_MANY / DISCONNECT / timeout -----+
///
///  responder:  Idle --CONNECT, admit--> Connected --DISCONNECT--> Disconnected
///                |                                                 ^
///                +---------- CONNECT, reject ----------------------+
/// ```
///
/// A transport session failure and a local disconnect end the handshake from every
///  non-terminal state. Once `Disconnected`, everything is ignored.
pub struct Handshake {
    role: Role,
    remote: PeerId,
    state: HandshakeState,
    close_reason: Option<CloseReason>,
}
impl Handshake {
    pub fn new(role: Role, remote: PeerId) -> Handshake {
        Handshake {
            role,
            remote,
            state: HandshakeState::Idle,
            close_reason: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_terminal(&self) -> bool {
        self.state == HandshakeState::Disconnected
    }

    /// Starts the handshake on the initiator side by sending CONNECT
    pub fn initiate(&mut self, sink: &dyn ControlSink) -> HandshakeOutcome {
        if self.role != Role::Initiator || self.state != HandshakeState::Idle {
            warn!(remote = ?self.remote, state = ?self.state, role = ?self.role, "handshake can only be initiated from Idle on the initiator side - ignoring");
            return HandshakeOutcome::Unchanged;
        }

        debug!(remote = ?self.remote, "sending CONNECT");
        if !sink.send_control(self.remote, ControlMessage::Connect) {
            return self.close(CloseReason::SendFailed, sink);
        }
        self.state = HandshakeState::Connecting;
        HandshakeOutcome::Unchanged
    }

    pub fn on_control(&mut self, msg: ControlMessage, sink: &dyn ControlSink) -> HandshakeOutcome {
        trace!(remote = ?self.remote, ?msg, state = ?self.state, "received control message");

        match (self.role, self.state, msg) {
            (_, HandshakeState::Disconnected, _) => HandshakeOutcome::Unchanged,

            (Role::Initiator, HandshakeState::Connecting, ControlMessage::Accept) => {
                debug!(remote = ?self.remote, "connection accepted");
                self.state = HandshakeState::Connected;
                HandshakeOutcome::Established
            }
            (Role::Initiator, HandshakeState::Connecting, ControlMessage::RejectTooMany) => {
                self.close(CloseReason::ServerFull, sink)
            }
            (Role::Initiator, HandshakeState::Connecting, ControlMessage::Disconnect) => {
                self.close(CloseReason::Refused, sink)
            }

            (Role::Responder, HandshakeState::Idle, ControlMessage::Connect) => {
                HandshakeOutcome::AdmissionRequested
            }

            (_, HandshakeState::Connected, ControlMessage::Disconnect) => {
                self.close(CloseReason::RemoteDisconnect, sink)
            }

            (role, state, msg) => {
                debug!(remote = ?self.remote, ?role, ?state, ?msg, "unexpected control message - ignoring");
                HandshakeOutcome::Unchanged
            }
        }
    }

    /// Completes a requested admission on the responder side by sending ACCEPT
    pub fn admit(&mut self, sink: &dyn ControlSink) -> HandshakeOutcome {
        if self.role != Role::Responder || self.state != HandshakeState::Idle {
            return HandshakeOutcome::Unchanged;
        }

        sink.accept_session(self.remote);
        if !sink.send_control(self.remote, ControlMessage::Accept) {
            return self.close(CloseReason::SendFailed, sink);
        }
        self.state = HandshakeState::Connected;
        HandshakeOutcome::Established
    }

    /// Declines a requested admission on the responder side with REJECT_TOO_MANY. The raw
    ///  session is left for the initiator to close.
    pub fn reject(&mut self, sink: &dyn ControlSink) -> HandshakeOutcome {
        if self.role != Role::Responder || self.state != HandshakeState::Idle {
            return HandshakeOutcome::Unchanged;
        }

        sink.send_control(self.remote, ControlMessage::RejectTooMany);
        self.terminate(CloseReason::ServerFull)
    }

    pub fn on_timeout(&mut self, sink: &dyn ControlSink) -> HandshakeOutcome {
        if self.state != HandshakeState::Connecting {
            return HandshakeOutcome::Unchanged;
        }
        self.close(CloseReason::Timeout, sink)
    }

    pub fn on_session_failed(&mut self, reason: SessionFailure, sink: &dyn ControlSink) -> HandshakeOutcome {
        if self.is_terminal() {
            return HandshakeOutcome::Unchanged;
        }
        warn!(remote = ?self.remote, code = reason.code(), "transport session failed: {}", reason);
        self.close(CloseReason::TransportFailure(reason), sink)
    }

    /// Ends the handshake from this side. If the remote side may consider itself connected,
    ///  it is sent a DISCONNECT - there is no acknowledgement.
    pub fn disconnect(&mut self, reason: CloseReason, sink: &dyn ControlSink) -> HandshakeOutcome {
        match self.state {
            HandshakeState::Disconnected => HandshakeOutcome::Unchanged,
            HandshakeState::Idle => self.terminate(reason),
            HandshakeState::Connecting | HandshakeState::Connected => {
                debug!(remote = ?self.remote, %reason, "sending DISCONNECT");
                sink.send_control(self.remote, ControlMessage::Disconnect);
                sink.close_session(self.remote, true);
                self.terminate(reason)
            }
        }
    }

    fn close(&mut self, reason: CloseReason, sink: &dyn ControlSink) -> HandshakeOutcome {
        sink.close_session(self.remote, false);
        self.terminate(reason)
    }

    fn terminate(&mut self, reason: CloseReason) -> HandshakeOutcome {
        debug!(remote = ?self.remote, role = ?self.role, %reason, "handshake ended");
        self.state = HandshakeState::Disconnected;
        self.close_reason = Some(reason);
        HandshakeOutcome::Closed(reason)
    }
}
