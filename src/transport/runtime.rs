use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::bail;
use tracing::{debug, info, trace, warn};

use crate::config::Reliability;
use crate::demux::{Demultiplexer, PollStats};
use crate::transport::notification::{NotificationHub, Subscription};
use crate::transport::{PeerId, RawTransport};


/// The explicitly constructed handle to the raw transport. It is created once by the
///  application, initialized, and then passed to every listener and client connection that
///  should use it.
///
/// The runtime's [Demultiplexer] is the only reader of the transport's channels. A runtime can
///  carry one listener and any number of client connections to distinct servers, all with the
///  same number of data channels.
///
/// While the runtime is not initialized (before [TransportRuntime::init] or after
///  [TransportRuntime::shutdown]), nothing is read from the transport and sending fails.
pub struct TransportRuntime {
    transport: Arc<dyn RawTransport>,
    hub: Arc<NotificationHub>,
    demux: Demultiplexer,
    initialized: AtomicBool,
}
impl TransportRuntime {
    pub fn new(transport: Arc<dyn RawTransport>) -> Arc<TransportRuntime> {
        Arc::new(TransportRuntime {
            transport,
            hub: NotificationHub::new(),
            demux: Demultiplexer::new(),
            initialized: AtomicBool::new(false),
        })
    }

    /// convenience for the common case of creating and initializing in one go
    pub fn start(transport: Arc<dyn RawTransport>) -> anyhow::Result<Arc<TransportRuntime>> {
        let runtime = Self::new(transport);
        runtime.init()?;
        Ok(runtime)
    }

    pub fn init(&self) -> anyhow::Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            bail!("transport runtime for {:?} is already initialized", self.transport.local_peer());
        }
        self.transport.attach(self.hub.clone());
        info!(local_peer = ?self.transport.local_peer(), "transport runtime initialized");
        Ok(())
    }

    pub fn shutdown(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            info!(local_peer = ?self.transport.local_peer(), "transport runtime shut down");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// The hub the transport publishes to - exposed for transport adapters that are wired up
    ///  outside of [RawTransport::attach]
    pub fn notification_hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn demux(&self) -> &Demultiplexer {
        &self.demux
    }

    /// A single poll cycle, dispatching everything currently available to the registered
    ///  listener and client connections
    pub fn poll(&self) -> PollStats {
        self.demux.poll_once(self)
    }

    pub fn send(&self, to: PeerId, buf: &[u8], channel: u8, reliability: Reliability) -> bool {
        if !self.is_initialized() {
            warn!(?to, "sending on a transport runtime that is not initialized - dropping");
            return false;
        }
        trace!(?to, channel, len = buf.len(), "sending packet");
        self.transport.send(to, buf, channel, reliability)
    }

    pub fn poll_available(&self, channel: u8) -> Option<usize> {
        if !self.is_initialized() {
            return None;
        }
        self.transport.poll_available(channel)
    }

    pub fn read_packet(&self, channel: u8, buf: &mut [u8]) -> Option<(usize, PeerId)> {
        if !self.is_initialized() {
            return None;
        }
        self.transport.read_packet(channel, buf)
    }

    pub fn accept_session(&self, peer: PeerId) -> bool {
        debug!(?peer, "accepting session");
        self.transport.accept_session(peer)
    }

    pub fn close_session(&self, peer: PeerId) -> bool {
        debug!(?peer, "closing session");
        self.transport.close_session(peer)
    }

    pub fn allow_relay(&self, allow: bool) {
        self.transport.allow_relay(allow)
    }
}


#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use crate::transport::MockRawTransport;
    use crate::transport::notification::TransportNotification;
    use super::*;

    fn mock_transport() -> MockRawTransport {
        let mut transport = MockRawTransport::new();
        transport.expect_local_peer()
            .return_const(PeerId(1));
        transport
    }

    #[test]
    fn test_init_attaches_hub_once() {
        let mut transport = mock_transport();
        transport.expect_attach()
            .times(1)
            .return_const(());

        let runtime = TransportRuntime::new(Arc::new(transport));
        assert!(!runtime.is_initialized());

        runtime.init().unwrap();
        assert!(runtime.is_initialized());
        assert!(runtime.init().is_err());
    }

    #[test]
    fn test_no_io_before_init() {
        let mut transport = mock_transport();
        transport.expect_send().never();
        transport.expect_poll_available().never();
        transport.expect_read_packet().never();

        let runtime = TransportRuntime::new(Arc::new(transport));
        assert!(!runtime.send(PeerId(2), b"x", 0, Reliability::Reliable));
        assert_eq!(runtime.poll_available(0), None);
        assert_eq!(runtime.read_packet(0, &mut [0u8; 4]), None);
    }

    #[test]
    fn test_no_io_after_shutdown() {
        let mut transport = mock_transport();
        transport.expect_attach().return_const(());
        transport.expect_poll_available()
            .with(eq(3))
            .times(1)
            .return_const(Some(7usize));

        let runtime = TransportRuntime::start(Arc::new(transport)).unwrap();
        assert_eq!(runtime.poll_available(3), Some(7));

        runtime.shutdown();
        assert_eq!(runtime.poll_available(3), None);
    }

    #[test]
    fn test_send_forwards_when_initialized() {
        let mut transport = mock_transport();
        transport.expect_attach().return_const(());
        transport.expect_send()
            .withf(|to, buf, channel, reliability| *to == PeerId(2) && buf == b"abc" && *channel == 1 && *reliability == Reliability::Unreliable)
            .times(1)
            .return_const(true);

        let runtime = TransportRuntime::start(Arc::new(transport)).unwrap();
        assert!(runtime.send(PeerId(2), b"abc", 1, Reliability::Unreliable));
    }

    #[test]
    fn test_subscribe_receives_published_notifications() {
        let runtime = TransportRuntime::new(Arc::new(mock_transport()));
        let mut subscription = runtime.subscribe();

        runtime.notification_hub()
            .publish(TransportNotification::SessionRequest { peer: PeerId(4) });

        assert_eq!(subscription.try_recv(), Some(TransportNotification::SessionRequest { peer: PeerId(4) }));
    }
}
