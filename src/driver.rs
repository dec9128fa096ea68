use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, Instrument, Span};

use crate::demux::PollStats;


/// Something that is driven by regular ticks, i.e. a listener or a client connection
pub trait Pump: Send + Sync + 'static {
    /// one cycle: handle transport notifications, then poll all channels
    fn pump(&self) -> PollStats;

    /// the driver stops after a tick for which this returns `true`
    fn is_finished(&self) -> bool {
        false
    }
}

/// A spawned task calling [Pump::pump] at a fixed interval. Dropping the handle stops the task.
pub struct DriverHandle {
    stop: Arc<Notify>,
    join_handle: JoinHandle<()>,
}
impl DriverHandle {
    /// Spawns the driver on the current tokio runtime. Fails if called outside a runtime.
    pub fn spawn(pump: Arc<dyn Pump>, interval: Duration, span: Span) -> anyhow::Result<DriverHandle> {
        let handle = Handle::try_current()
            .map_err(|e| anyhow!("a driver must be started from within a tokio runtime: {}", e))?;

        let stop = Arc::new(Notify::new());
        let join_handle = handle.spawn(run_driver(pump, interval, stop.clone()).instrument(span));

        Ok(DriverHandle {
            stop,
            join_handle,
        })
    }

    pub fn stop(&self) {
        // stores a permit if the driver is not waiting right now
        self.stop.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_driver(pump: Arc<dyn Pump>, interval: Duration, stop: Arc<Notify>) {
    debug!("starting driver");

    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticks.tick() => {
                let stats = pump.pump();
                if !stats.is_empty() {
                    trace!(control = stats.control, delivered = stats.delivered, dropped = stats.dropped, "poll cycle");
                }
                if pump.is_finished() {
                    debug!("driver finished");
                    return;
                }
            }
            _ = stop.notified() => {
                debug!("driver stopped");
                return;
            }
        }
    }
}
