//! Utilities for testing code that uses listeners and client connections. They are used for
//!  this crate's own tests, but they are also exported for application testing, so that
//!  application code can run a server and its clients in a single process on a
//!  [MemoryNetwork].

use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::config::ConnectionOptions;
use crate::transport::memory::MemoryNetwork;
use crate::transport::runtime::TransportRuntime;
use crate::transport::PeerId;


pub fn test_peer(number: u64) -> PeerId {
    PeerId(number)
}

/// Adds `peer` to the network and returns an initialized runtime for it
pub fn memory_runtime(network: &MemoryNetwork, peer: PeerId) -> Arc<TransportRuntime> {
    let runtime = TransportRuntime::new(network.add_peer(peer));
    if let Err(e) = runtime.init() {
        error!("initializing a fresh transport runtime failed: {}", e);
    }
    runtime
}

/// Options with a short connect timeout and no disconnect linger, so that tests with paused
///  time do not need to advance the clock much
pub fn test_options(max_connections: usize) -> ConnectionOptions {
    let mut options = ConnectionOptions::new();
    options.max_connections = max_connections;
    options.connect_timeout = Duration::from_secs(1);
    options.disconnect_linger = Duration::ZERO;
    options
}

/// Gives spawned drivers time for a few poll cycles. Intended for tests running with paused
///  time, where this does not actually wait.
pub async fn settle(options: &ConnectionOptions) {
    tokio::time::sleep(options.pump_interval * 5).await;
}
