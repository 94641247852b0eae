//! Measurement results.

use crate::target::PingTarget;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Outcome class of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResultCode {
    /// A hop answered: either an echo reply from the destination or a
    /// time-exceeded from an intermediate router. Both are valid path
    /// responses.
    Ok,
    /// No answer arrived within the engine timeout.
    NoReply,
}

/// One emitted measurement.
#[derive(Debug, Clone)]
pub struct PingResult {
    /// Monotonic per-target probe index, independent of the wrapping
    /// 16-bit wire sequence. Lets consumers reorder results that arrive
    /// out of send order.
    pub sample_number: u64,
    pub code: PingResultCode,
    /// The address that answered; `None` for `NoReply`.
    pub reply_address: Option<IpAddr>,
    /// Wall-clock transmit instant, for correlation with external logs.
    pub transmit_epoch: SystemTime,
    pub round_trip: Duration,
    pub target: Arc<PingTarget>,
}
