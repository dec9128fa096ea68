use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::config::{ConnectionOptions, Reliability};
use crate::handshake::control_messages::ControlMessage;
use crate::handshake::ControlSink;
use crate::transport::runtime::TransportRuntime;
use crate::transport::PeerId;


/// [ControlSink] that talks to the raw transport
pub struct TransportControlSink {
    runtime: Arc<TransportRuntime>,
    control_channel: u8,
    disconnect_linger: Duration,
}
impl TransportControlSink {
    pub fn new(runtime: Arc<TransportRuntime>, options: &ConnectionOptions) -> TransportControlSink {
        TransportControlSink {
            runtime,
            control_channel: options.control_channel(),
            disconnect_linger: options.disconnect_linger,
        }
    }
}

impl ControlSink for TransportControlSink {
    fn send_control(&self, to: PeerId, msg: ControlMessage) -> bool {
        trace!(?to, ?msg, "sending control message");
        let result = self.runtime.send(to, &msg.ser(), self.control_channel, Reliability::Reliable);
        if !result {
            debug!(?to, ?msg, "transport refused control message");
        }
        result
    }

    fn accept_session(&self, peer: PeerId) -> bool {
        self.runtime.accept_session(peer)
    }

    fn close_session(&self, peer: PeerId, after_disconnect: bool) {
        if !after_disconnect || self.disconnect_linger.is_zero() {
            self.runtime.close_session(peer);
            return;
        }

        // without a tokio runtime (e.g. dropping a listener from a plain thread) there is no
        //  way to delay, so the session is closed right away
        match Handle::try_current() {
            Ok(handle) => {
                let runtime = self.runtime.clone();
                let linger = self.disconnect_linger;
                handle.spawn(async move {
                    tokio::time::sleep(linger).await;
                    runtime.close_session(peer);
                });
            }
            Err(_) => {
                self.runtime.close_session(peer);
            }
        }
    }
}
