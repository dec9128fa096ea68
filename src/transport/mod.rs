//! The raw peer-to-peer transport this crate builds on, and the glue around it.
//!
//! [RawTransport] is the seam to the actual networking SDK. It is deliberately synchronous and
//!  poll based because that is what P2P SDKs offer: packets are queued per channel inside the
//!  SDK, and the application asks for them once per tick. Session level events (a peer wants
//!  to talk to us, a session failed) arrive asynchronously on the SDK's callback thread and
//!  are pushed into a [notification::NotificationHub].

pub mod memory;
pub mod notification;
pub mod peer_id;
pub mod runtime;

use std::sync::Arc;
#[cfg(test)] use mockall::automock;

use crate::config::Reliability;
use crate::transport::notification::NotificationHub;

pub use peer_id::PeerId;


#[cfg_attr(test, automock)]
pub trait RawTransport: Send + Sync + 'static {
    /// The local peer's own id on the transport's network
    fn local_peer(&self) -> PeerId;

    /// Hands a packet to the transport. Returns `false` if the transport refused it (e.g. too
    ///  big, no network) - `true` does not imply delivery.
    fn send(&self, to: PeerId, buf: &[u8], channel: u8, reliability: Reliability) -> bool;

    /// The size of the next packet waiting on `channel`, if any
    fn poll_available(&self, channel: u8) -> Option<usize>;

    /// Reads the next packet waiting on `channel` into `buf`, returning the number of bytes read
    ///  and the sender
    fn read_packet(&self, channel: u8, buf: &mut [u8]) -> Option<(usize, PeerId)>;

    fn accept_session(&self, peer: PeerId) -> bool;

    fn close_session(&self, peer: PeerId) -> bool;

    fn allow_relay(&self, allow: bool);

    /// Called once by the runtime during initialization. The transport publishes all its
    ///  asynchronous notifications to the hub from then on.
    fn attach(&self, hub: Arc<NotificationHub>);
}
