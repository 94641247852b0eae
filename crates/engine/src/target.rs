//! Ping targets.

use pingpath_socket::ProbeSocket;
use rand::Rng;
use serde_json::json;
use std::any::Any;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;

/// One destination being measured by an engine.
///
/// Carries the fixed ICMP identifier used for every probe to this target,
/// the per-target wire sequence and sample counters, and the write socket
/// configured with the target's TTL. Targets are created through
/// [`PingEngine::add_target`](crate::PingEngine::add_target) and live as
/// long as their engine.
pub struct PingTarget {
    host_address: Mutex<IpAddr>,
    ttl: u8,
    id: u16,
    socket: Box<dyn ProbeSocket>,
    sequence: AtomicU16,
    sample_number: AtomicU64,
    active: AtomicBool,
    user_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl PingTarget {
    pub(crate) fn new(host_address: IpAddr, ttl: u8, socket: Box<dyn ProbeSocket>) -> Self {
        Self {
            host_address: Mutex::new(host_address),
            ttl,
            // The identifier is the fixed half of every correlation key
            // for this target; zero is reserved.
            id: rand::thread_rng().gen_range(1..=u16::MAX),
            socket,
            sequence: AtomicU16::new(0),
            sample_number: AtomicU64::new(0),
            active: AtomicBool::new(true),
            user_data: Mutex::new(None),
        }
    }

    pub fn host_address(&self) -> IpAddr {
        *self.host_address.lock().expect("host address mutex poisoned")
    }

    pub fn set_host_address(&self, host_address: IpAddr) {
        *self.host_address.lock().expect("host address mutex poisoned") = host_address;
    }

    /// TTL applied to probes for this target; 0 means the system default.
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// The ICMP identifier embedded in every probe to this target.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Attaches an opaque consumer value to this target.
    pub fn set_user_data(&self, data: Option<Box<dyn Any + Send + Sync>>) {
        *self.user_data.lock().expect("user data mutex poisoned") = data;
    }

    /// Runs `f` against the attached consumer value, if any.
    pub fn with_user_data<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send + Sync)>) -> R) -> R {
        let guard = self.user_data.lock().expect("user data mutex poisoned");
        f(guard.as_deref())
    }

    pub(crate) fn socket(&self) -> &dyn ProbeSocket {
        self.socket.as_ref()
    }

    /// Next 16-bit wire sequence, wrapping and skipping zero so the
    /// correlation key never collides with an unset field.
    pub(crate) fn next_sequence(&self) -> u16 {
        loop {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if sequence != 0 {
                return sequence;
            }
        }
    }

    pub(crate) fn next_sample_number(&self) -> u64 {
        self.sample_number.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the transmitter should still probe this target. Cleared by
    /// `remove_target`; in-flight probes run to completion or timeout.
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Emits the target's persistable state.
    pub fn save_configuration(&self) -> serde_json::Value {
        json!({
            "hostAddress": self.host_address().to_string(),
            "ttl": self.ttl,
        })
    }

    /// Applies persisted state; unknown keys are ignored and missing keys
    /// keep their current values.
    pub fn load_configuration(&self, configuration: &serde_json::Value) -> bool {
        if let Some(host) = configuration.get("hostAddress").and_then(|v| v.as_str()) {
            match host.parse() {
                Ok(addr) => self.set_host_address(addr),
                Err(_) => return false,
            }
        }
        true
    }
}

impl std::fmt::Debug for PingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingTarget")
            .field("host_address", &self.host_address())
            .field("ttl", &self.ttl)
            .field("id", &self.id)
            .finish()
    }
}
