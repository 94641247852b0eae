//! Transmitter worker.

use crate::engine::EngineShared;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Scheduler slice; bounds both shutdown latency and how quickly an
/// interval change is picked up.
const SLICE: Duration = Duration::from_millis(50);

/// Worker loop: one transmit round per interval, re-reading the interval
/// every slice so `set_interval` applies mid-flight.
pub(crate) fn run(shared: Arc<EngineShared>) {
    let mut last_round: Option<Instant> = None;

    while shared.is_running() {
        let due = match last_round {
            None => true,
            Some(at) => at.elapsed() >= shared.interval(),
        };
        if due {
            shared.transmit_round();
            last_round = Some(Instant::now());
        }
        thread::sleep(SLICE);
    }
}
