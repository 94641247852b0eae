//! In-flight probe records.

use crate::target::PingTarget;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

/// Timing and race state of one in-flight probe, behind the item's own
/// lock so the table lock never has to be held across a serviced check.
#[derive(Debug)]
pub(crate) struct ItemState {
    /// Set by whichever of reply or timeout gets there first; the loser
    /// observes it and discards its result.
    pub serviced: bool,
    /// High-resolution transmit timestamp; the latency reference.
    pub transmit_time: Instant,
    /// Wall-clock transmit timestamp carried into the result.
    pub transmit_epoch: SystemTime,
}

/// Record of a single in-flight probe, keyed in the engine's request table
/// by `probe_key(id, sequence)`.
#[derive(Debug)]
pub(crate) struct PingItem {
    pub id: u16,
    pub sequence: u16,
    pub sample_number: u64,
    pub target: Arc<PingTarget>,
    state: Mutex<ItemState>,
}

impl PingItem {
    pub fn new(target: Arc<PingTarget>, sequence: u16, sample_number: u64) -> Self {
        Self {
            id: target.id(),
            sequence,
            sample_number,
            target,
            state: Mutex::new(ItemState {
                serviced: false,
                transmit_time: Instant::now(),
                transmit_epoch: SystemTime::now(),
            }),
        }
    }

    pub fn key(&self) -> u32 {
        pingpath_core::probe_key(self.id, self.sequence)
    }

    /// Re-stamps the transmit clocks. Called after the item is visible in
    /// the request table and immediately before `sendto`, so the measured
    /// latency covers only the wire and the kernel send path.
    pub fn stamp_transmit(&self) {
        let mut state = self.lock();
        state.transmit_time = Instant::now();
        state.transmit_epoch = SystemTime::now();
    }

    pub fn lock(&self) -> MutexGuard<'_, ItemState> {
        self.state.lock().expect("ping item mutex poisoned")
    }

    /// Claims the item for result emission. Returns the transmit
    /// timestamps if this caller won the reply-vs-timeout race, `None` if
    /// the item was already serviced.
    pub fn claim(&self) -> Option<(Instant, SystemTime)> {
        let mut state = self.lock();
        if state.serviced {
            return None;
        }
        state.serviced = true;
        Some((state.transmit_time, state.transmit_epoch))
    }
}
