//! Tracking stage: streams head poses to the server at a fixed cadence

use crate::net::packets::FromHeadset;
use crate::pipeline::receiver::coordinator::StreamShared;
use log::{debug, info};
use std::sync::Arc;

pub(crate) fn run_tracking(shared: Arc<StreamShared>) {
    info!("TrackingStage: started");
    let interval = shared.config.tracking_interval();
    let mut sent = 0u64;

    while !shared.sos.wait_timeout(interval) {
        let Some(tracking) = shared.headset.tracking(shared.clock.now()) else {
            continue;
        };
        match shared.send(FromHeadset::Tracking(tracking)) {
            Ok(()) => sent += 1,
            Err(e) => debug!("TrackingStage: send failed: {:#}", e),
        }
    }

    info!("TrackingStage: finished ({} poses sent)", sent);
}
