use std::time::Duration;
use anyhow::bail;


/// Delivery mode for a channel. The raw transport implements the actual semantics, this crate
///  just passes the configured mode along with every packet sent on a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Reliability {
    /// fire and forget, packets may be dropped or arrive out of order
    Unreliable,
    /// like [Reliability::Unreliable], but the transport sends immediately instead of batching
    UnreliableNoDelay,
    /// guaranteed delivery, in order per channel
    Reliable,
    /// like [Reliability::Reliable], but the transport may coalesce small packets
    ReliableWithBuffering,
}
impl Reliability {
    pub fn is_reliable(&self) -> bool {
        match *self {
            Reliability::Reliable | Reliability::ReliableWithBuffering => true,
            Reliability::Unreliable | Reliability::UnreliableNoDelay => false,
        }
    }
}

/// Settings shared by a listener and all its connections, or by a single client connection.
///  They are wrapped in an `Arc` when a listener or connection is created and never change
///  afterwards.
///
/// NB: Both sides of a connection must agree on the number of channels since the control
///      channel's index is derived from it.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Allow the raw transport to fall back to relaying through the provider's servers if no
    ///  direct connection can be established
    pub allow_relay: bool,

    /// The maximum number of concurrently connected peers on a listener. Further CONNECT
    ///  requests are answered with REJECT_TOO_MANY.
    pub max_connections: usize,

    /// Data channels, indexed by position. The control channel is the first index after these.
    pub channels: Vec<Reliability>,

    /// How long a client waits for ACCEPT (or a rejection) before giving up
    pub connect_timeout: Duration,

    /// Upper bound for the number of packets read from a single channel in one poll cycle, so
    ///  that a flooded channel can not starve the others
    pub max_poll_batch_size: usize,

    /// Tick interval of the spawned driver loop
    pub pump_interval: Duration,

    /// Delay between sending DISCONNECT and closing the raw session, giving the transport a
    ///  chance to flush the DISCONNECT message. Zero closes immediately.
    pub disconnect_linger: Duration,
}

impl ConnectionOptions {
    pub fn new() -> ConnectionOptions {
        ConnectionOptions {
            allow_relay: true,
            max_connections: 16,
            channels: vec![Reliability::Reliable, Reliability::Unreliable],
            connect_timeout: Duration::from_secs(25),
            max_poll_batch_size: 256,
            pump_interval: Duration::from_millis(10),
            disconnect_linger: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.channels.is_empty() {
            bail!("at least one data channel must be configured");
        }
        if self.channels.len() > u8::MAX as usize {
            bail!("at most {} data channels are supported, {} were configured", u8::MAX, self.channels.len());
        }
        if self.max_poll_batch_size == 0 {
            bail!("max_poll_batch_size must be at least 1");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must not be zero");
        }
        if self.pump_interval.is_zero() {
            bail!("pump_interval must not be zero");
        }
        Ok(())
    }

    /// The reserved channel for handshake messages, disjoint from all data channels
    pub fn control_channel(&self) -> u8 {
        self.channels.len() as u8
    }

    pub fn num_data_channels(&self) -> u8 {
        self.channels.len() as u8
    }

    pub fn reliability(&self, channel: u8) -> Option<Reliability> {
        self.channels.get(channel as usize).copied()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::new()
    }
}
