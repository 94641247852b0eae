//! Timeout scanner worker.

use crate::engine::EngineShared;
use pingpath_core::TIMEOUT_SWEEP_INTERVAL_MS;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLICE: Duration = Duration::from_millis(50);

/// Worker loop: sweep the request table at a slow cadence, reporting
/// probes that aged past the engine timeout as lost samples.
pub(crate) fn run(shared: Arc<EngineShared>) {
    let cadence = Duration::from_millis(TIMEOUT_SWEEP_INTERVAL_MS);
    let mut last_sweep = Instant::now();

    while shared.is_running() {
        if last_sweep.elapsed() >= cadence {
            shared.sweep_timeouts();
            last_sweep = Instant::now();
        }
        thread::sleep(SLICE);
    }
}
