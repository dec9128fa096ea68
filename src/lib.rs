//! Connection handshake, identity mapping and channel demultiplexing on top of a connectionless,
//!  channelized peer-to-peer datagram transport (e.g. Steam P2P networking).
//!
//! The raw transport takes care of reliability, ordering per channel, NAT traversal and relay
//!  fallback. What it does not provide is a notion of 'connection' that a game networking
//!  framework can wait on: packets just arrive from peer ids on numbered channels, and session
//!  acceptance is fire-and-forget. This crate layers a tiny control protocol on top of that:
//!
//! ```ascii
//!  client                              server
//!    | --- CONNECT ------------------->   |   capacity available: map peer -> connection id
//!    | <-- ACCEPT ---------------------   |
//!    |                                    |
//!    | <-- REJECT_TOO_MANY ------------   |   (instead of ACCEPT if the server is full)
//!    |                                    |
//!    | --- DISCONNECT ---------------->   |   (either side, no acknowledgement)
//! ```
//!
//! Control messages are single bytes on a reserved control channel, which is the channel index
//!  *after* the last configured data channel. Data packets on the data channels are routed to a
//!  connection's inbound queue only if their sender completed the handshake; everything else is
//!  dropped.
//!
//! Entry points are [listener::Listener] on the accepting side and [client::connect_to] on the
//!  connecting side, both working on a [transport::runtime::TransportRuntime] that wraps the
//!  actual [transport::RawTransport].

pub mod client;
pub mod config;
pub mod connection;
pub mod demux;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod identity_map;
pub mod listener;
pub mod test_util;
pub mod transport;
