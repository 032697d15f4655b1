//! Drives an [`EndPoint`]'s pump from a tokio task, for applications that do not want to
//!  dedicate a thread to calling [`EndPoint::update`].

use crate::end_point::EndPoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Stops the pump task when dropped
pub struct PumpHandle {
    join_handle: JoinHandle<()>,
}

impl PumpHandle {
    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }

    pub async fn shutdown(mut self) {
        self.join_handle.abort();
        // the result is always 'cancelled' since the pump loop never returns
        let _ = (&mut self.join_handle).await;
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

/// Run one pump cycle per `tick`. Each cycle is non-blocking, so it is fine to run it on the
///  async runtime's worker threads.
pub fn spawn_pump(end_point: Arc<EndPoint>, tick: Duration) -> PumpHandle {
    debug!("starting pump task with a tick of {:?}", tick);

    let join_handle = tokio::spawn(async move {
        let mut ticks = time::interval(tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;
            let remaining = end_point.update(Duration::ZERO).await;
            trace!("pump cycle done, {:?} of budget remaining", remaining);
        }
    });

    PumpHandle { join_handle }
}
