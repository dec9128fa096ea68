use thiserror::Error;

use crate::handshake::CloseReason;
use crate::transport::notification::SessionFailure;


/// Outcome of a failed [crate::client::connect_to]
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConnectError {
    #[error("the transport runtime is not initialized")]
    NotInitialized,
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("there is already a connection to this server on the transport runtime")]
    AlreadyConnected,
    #[error("the transport refused to send the connect request")]
    SendFailed,
    #[error("the server is full")]
    ServerFull,
    #[error("the server refused the connection")]
    Refused,
    #[error("no response from the server")]
    Timeout,
    #[error("transport session failed: {0}")]
    TransportFailure(SessionFailure),
}

impl ConnectError {
    /// Maps the reason a connection attempt ended to the error reported to the caller.
    pub fn from_close_reason(reason: CloseReason) -> ConnectError {
        match reason {
            CloseReason::ServerFull => ConnectError::ServerFull,
            CloseReason::Timeout => ConnectError::Timeout,
            CloseReason::TransportFailure(failure) => ConnectError::TransportFailure(failure),
            CloseReason::SendFailed => ConnectError::SendFailed,
            CloseReason::Refused
            | CloseReason::RemoteDisconnect
            | CloseReason::LocalDisconnect
            | CloseReason::ListenerStopped => ConnectError::Refused,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConnectionError {
    #[error("the connection is not established")]
    NotConnected,
    #[error("the connection is closed")]
    ConnectionClosed,
    #[error("channel {0} is not configured")]
    InvalidChannel(u8),
    #[error("the transport refused to send the packet")]
    SendFailed,
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(CloseReason::ServerFull, ConnectError::ServerFull)]
    #[case(CloseReason::Refused, ConnectError::Refused)]
    #[case(CloseReason::Timeout, ConnectError::Timeout)]
    #[case(CloseReason::SendFailed, ConnectError::SendFailed)]
    #[case(CloseReason::RemoteDisconnect, ConnectError::Refused)]
    #[case(CloseReason::TransportFailure(SessionFailure::Other(17)), ConnectError::TransportFailure(SessionFailure::Other(17)))]
    fn test_from_close_reason(#[case] reason: CloseReason, #[case] expected: ConnectError) {
        assert_eq!(ConnectError::from_close_reason(reason), expected);
    }

    #[test]
    fn test_transport_failure_message_keeps_reason() {
        let msg = ConnectError::TransportFailure(SessionFailure::DestinationNotLoggedIn).to_string();
        assert!(msg.contains("not connected to the network"), "{}", msg);
    }
}
