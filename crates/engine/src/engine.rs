//! The measurement engine: request table, receive handler, lifecycle.

use crate::item::PingItem;
use crate::receiver::{PacketListener, PacketRouter};
use crate::result::{PingResult, PingResultCode};
use crate::target::PingTarget;
use crate::{timeout, transmitter};
use pingpath_core::{
    probe_key, EngineResult, IpVersion, DEFAULT_PING_INTERVAL_MS, DEFAULT_RECEIVE_TIMEOUT_MS,
    DEFAULT_TERMINATE_TIMEOUT_MS, PING_PAYLOAD_LENGTH,
};
use pingpath_packet::{echo_request, IcmpKind, IcmpPacket};
use pingpath_socket::{local_address_for, SocketProvider};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// State shared between the engine handle, its worker threads, and the
/// process-wide receive path.
pub(crate) struct EngineShared {
    version: IpVersion,
    sockets: Arc<dyn SocketProvider>,
    /// In-flight probes keyed by `probe_key(id, sequence)`. Held only for
    /// lookup, insert, and remove; never across I/O or result emission.
    requests: Mutex<HashMap<u32, Arc<PingItem>>>,
    targets: Mutex<Vec<Arc<PingTarget>>>,
    interval: Mutex<Duration>,
    timeout: Mutex<Duration>,
    epoch: Mutex<SystemTime>,
    running: AtomicBool,
    subscribers: Mutex<Vec<mpsc::Sender<PingResult>>>,
}

impl EngineShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn interval(&self) -> Duration {
        *self.interval.lock().expect("interval mutex poisoned")
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock().expect("timeout mutex poisoned")
    }

    fn add_request(&self, item: Arc<PingItem>) {
        let mut requests = self.requests.lock().expect("request table mutex poisoned");
        requests.insert(item.key(), item);
    }

    fn get_request(&self, key: u32) -> Option<Arc<PingItem>> {
        let requests = self.requests.lock().expect("request table mutex poisoned");
        requests.get(&key).cloned()
    }

    fn remove_request(&self, key: u32) {
        let mut requests = self.requests.lock().expect("request table mutex poisoned");
        requests.remove(&key);
    }

    /// Sends the result to every subscriber; all subscribers observe the
    /// same linear sequence. Disconnected subscribers are dropped.
    fn emit(&self, result: PingResult) {
        let mut subscribers = self.subscribers.lock().expect("subscriber mutex poisoned");
        subscribers.retain(|sender| sender.send(result.clone()).is_ok());
    }

    /// One transmit pass over the active targets.
    ///
    /// The request-table entry is inserted before the packet leaves the
    /// host so a fast reply can never beat its own bookkeeping, and the
    /// transmit clocks are stamped after insertion so the measured
    /// latency excludes the table work.
    pub(crate) fn transmit_round(&self) {
        let targets: Vec<Arc<PingTarget>> = {
            let targets = self.targets.lock().expect("target list mutex poisoned");
            targets.iter().filter(|t| t.is_active()).cloned().collect()
        };

        for target in targets {
            let host = target.host_address();
            let sequence = target.next_sequence();
            let sample_number = target.next_sample_number();
            let buffer =
                echo_request(target.id(), sequence, PING_PAYLOAD_LENGTH, &host, self.version);

            let item = Arc::new(PingItem::new(target.clone(), sequence, sample_number));
            self.add_request(item.clone());
            item.stamp_transmit();

            match target.socket().send_to(&buffer, &host) {
                Ok(_) => {
                    trace!(%host, id = target.id(), sequence, sample_number, "probe sent");
                }
                Err(err) => {
                    // The entry stays in the table; the timeout scanner
                    // reports the sample as lost.
                    warn!(%host, error = %err, "probe send failed");
                }
            }
        }
    }

    /// One pass of the timeout scanner: claim and remove every entry
    /// older than the configured timeout, then report the losses.
    pub(crate) fn sweep_timeouts(&self) {
        let timeout = self.timeout();
        let now = Instant::now();
        let mut expired: Vec<(Arc<PingItem>, Duration, SystemTime)> = Vec::new();

        {
            let mut requests = self.requests.lock().expect("request table mutex poisoned");
            requests.retain(|_, item| {
                let mut state = item.lock();
                if state.serviced {
                    // Claimed by the receive path; it owns the removal.
                    return true;
                }
                let age = now.saturating_duration_since(state.transmit_time);
                if age <= timeout {
                    return true;
                }
                state.serviced = true;
                expired.push((item.clone(), age, state.transmit_epoch));
                false
            });
        }

        for (item, age, transmit_epoch) in expired {
            trace!(
                host = %item.target.host_address(),
                sample_number = item.sample_number,
                "probe timed out"
            );
            self.emit(PingResult {
                sample_number: item.sample_number,
                code: PingResultCode::NoReply,
                reply_address: None,
                transmit_epoch,
                round_trip: age,
                target: item.target.clone(),
            });
        }
    }

    /// Receive-path handler for one datagram, shared-socket fan-in.
    fn handle_packet(&self, receive_time: Instant, buffer: &[u8], source: IpAddr) {
        // The v6 checksum covers the pseudo-header, so the parser needs
        // the address the datagram was sent to; the local address on the
        // route back to the source is that address.
        let destination = match self.version {
            IpVersion::V4 => self.version.unspecified(),
            IpVersion::V6 => match local_address_for(&source) {
                Ok(address) => address,
                Err(err) => {
                    trace!(%source, error = %err, "no local address toward source");
                    return;
                }
            },
        };
        let packet = IcmpPacket::from_bytes(buffer, self.version, &source, &destination);
        let code = match packet.kind() {
            // Both shapes are valid hop responses for path analysis: the
            // destination answers with an echo reply, intermediate hops
            // with time-exceeded.
            IcmpKind::EchoReply | IcmpKind::TimeExceeded => PingResultCode::Ok,
            // Our own requests are visible on loopback; foreign or
            // malformed traffic is routine on a shared ICMP socket.
            IcmpKind::EchoRequest | IcmpKind::Invalid => return,
        };

        let key = probe_key(packet.id(), packet.sequence());
        let Some(item) = self.get_request(key) else {
            // Another engine's probe, or a late duplicate.
            return;
        };
        let Some((transmit_time, transmit_epoch)) = item.claim() else {
            trace!(key, "reply arrived after the sample was already serviced");
            return;
        };

        let round_trip = receive_time.saturating_duration_since(transmit_time);
        trace!(%source, sample_number = item.sample_number, ?round_trip, "reply received");

        self.emit(PingResult {
            sample_number: item.sample_number,
            code,
            reply_address: Some(source),
            transmit_epoch,
            round_trip,
            target: item.target.clone(),
        });
        self.remove_request(key);
    }
}

impl PacketListener for EngineShared {
    fn version(&self) -> IpVersion {
        self.version
    }

    fn packet_received(&self, receive_time: Instant, buffer: &[u8], source: IpAddr) {
        self.handle_packet(receive_time, buffer, source);
    }
}

/// A continuous ping measurement engine for one IP version.
///
/// Created through [`PingEngineFactory`](crate::PingEngineFactory).
/// Workers run between [`start`](Self::start) and [`stop`](Self::stop);
/// results flow to every receiver returned by [`results`](Self::results).
pub struct PingEngine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingEngine").finish_non_exhaustive()
    }
}

impl PingEngine {
    pub(crate) fn new(
        version: IpVersion,
        sockets: Arc<dyn SocketProvider>,
        router: &Arc<PacketRouter>,
    ) -> EngineResult<Self> {
        let shared = Arc::new(EngineShared {
            version,
            sockets,
            requests: Mutex::new(HashMap::new()),
            targets: Mutex::new(Vec::new()),
            interval: Mutex::new(Duration::from_millis(DEFAULT_PING_INTERVAL_MS)),
            timeout: Mutex::new(Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MS)),
            epoch: Mutex::new(SystemTime::now()),
            running: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        });

        let listener: Arc<dyn PacketListener> = shared.clone();
        router.register(Arc::downgrade(&listener))?;

        Ok(Self {
            shared,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn version(&self) -> IpVersion {
        self.shared.version
    }

    /// Adds a measurement target with the system default TTL.
    pub fn add_target(&self, host_address: IpAddr) -> EngineResult<Arc<PingTarget>> {
        self.add_target_with_ttl(host_address, 0)
    }

    /// Adds a measurement target probed with the given TTL (0 keeps the
    /// system default). The target gets its own write socket so the TTL
    /// is fixed for its lifetime.
    pub fn add_target_with_ttl(
        &self,
        host_address: IpAddr,
        ttl: u8,
    ) -> EngineResult<Arc<PingTarget>> {
        if !self.shared.version.matches(&host_address) {
            return Err(pingpath_core::EngineError::VersionMismatch {
                addr: host_address,
                version: self.shared.version,
            });
        }
        let socket = self.shared.sockets.write_socket(ttl, self.shared.version)?;
        let target = Arc::new(PingTarget::new(host_address, ttl, socket));
        self.shared
            .targets
            .lock()
            .expect("target list mutex poisoned")
            .push(target.clone());
        debug!(host = %host_address, ttl, id = target.id(), "target added");
        Ok(target)
    }

    /// Stops probing the target. Probes already in flight run to
    /// completion or time out normally.
    pub fn remove_target(&self, target: &Arc<PingTarget>) -> bool {
        let targets = self.shared.targets.lock().expect("target list mutex poisoned");
        let found = targets.iter().any(|entry| Arc::ptr_eq(entry, target));
        if found {
            target.deactivate();
        }
        found
    }

    /// Sets the transmit interval; takes effect within one scheduler
    /// slice even while running.
    pub fn set_interval(&self, interval: Duration) -> bool {
        if interval.is_zero() {
            return false;
        }
        *self.shared.interval.lock().expect("interval mutex poisoned") = interval;
        true
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval()
    }

    /// Sets the age after which an unanswered probe is reported lost.
    pub fn set_timeout(&self, timeout: Duration) -> bool {
        *self.shared.timeout.lock().expect("timeout mutex poisoned") = timeout;
        true
    }

    /// Sets the wall-clock reference used to anchor transmit epochs.
    pub fn set_epoch(&self, epoch: SystemTime) {
        *self.shared.epoch.lock().expect("epoch mutex poisoned") = epoch;
    }

    pub fn epoch(&self) -> SystemTime {
        *self.shared.epoch.lock().expect("epoch mutex poisoned")
    }

    /// Returns a new subscription to the result stream. Every
    /// subscription observes the full sequence of results emitted after
    /// it is created.
    pub fn results(&self) -> mpsc::Receiver<PingResult> {
        let (sender, receiver) = mpsc::channel();
        self.shared
            .subscribers
            .lock()
            .expect("subscriber mutex poisoned")
            .push(sender);
        receiver
    }

    /// Starts the transmitter and timeout workers. Idempotent.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return true;
        }

        let mut workers = self.workers.lock().expect("worker list mutex poisoned");
        let transmit_shared = self.shared.clone();
        workers.push(
            thread::Builder::new()
                .name("pingpath-transmit".into())
                .spawn(move || transmitter::run(transmit_shared))
                .expect("failed to spawn transmitter thread"),
        );
        let timeout_shared = self.shared.clone();
        workers.push(
            thread::Builder::new()
                .name("pingpath-timeout".into())
                .spawn(move || timeout::run(timeout_shared))
                .expect("failed to spawn timeout thread"),
        );
        true
    }

    /// Stops the workers, waiting up to the shutdown deadline for each,
    /// and drains outstanding probes without emitting results.
    pub fn stop(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return true;
        }

        let workers = std::mem::take(
            &mut *self.workers.lock().expect("worker list mutex poisoned"),
        );
        let deadline = Instant::now() + Duration::from_millis(DEFAULT_TERMINATE_TIMEOUT_MS);
        let mut all_stopped = true;
        for handle in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // Abandoned; the loop will exit on its next flag check.
                warn!("worker failed to stop within the shutdown deadline");
                all_stopped = false;
            }
        }

        self.shared
            .requests
            .lock()
            .expect("request table mutex poisoned")
            .clear();
        all_stopped
    }

    /// Emits the engine's persistable state: probe interval and epoch.
    pub fn save_configuration(&self) -> serde_json::Value {
        let epoch_ms = self
            .epoch()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        json!({
            "interval": self.interval().as_millis() as u64,
            "epoch": epoch_ms,
        })
    }

    /// Applies persisted state. Unknown keys are ignored; missing keys
    /// keep their defaults.
    pub fn load_configuration(&self, configuration: &serde_json::Value) -> bool {
        if let Some(interval) = configuration.get("interval").and_then(|v| v.as_u64()) {
            if !self.set_interval(Duration::from_millis(interval)) {
                return false;
            }
        }
        if let Some(epoch) = configuration.get("epoch").and_then(|v| v.as_u64()) {
            self.set_epoch(UNIX_EPOCH + Duration::from_millis(epoch));
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }
}

impl Drop for PingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::PingEngineFactory;
    use crate::receiver::tests_support::ScriptedProvider;
    use std::net::Ipv4Addr;

    const OUTER_SOURCE: Ipv4Addr = Ipv4Addr::new(10, 99, 0, 1);

    fn scripted_engine() -> (
        mpsc::Sender<(Vec<u8>, IpAddr)>,
        PingEngineFactory,
        PingEngine,
    ) {
        let (sender, provider) = ScriptedProvider::new(IpVersion::V4);
        let factory = PingEngineFactory::with_provider(provider);
        let engine = factory.create(IpVersion::V4).expect("engine");
        (sender, factory, engine)
    }

    /// Builds a v4 Time Exceeded datagram quoting the probe `(id, seq)`,
    /// as a router on the path would emit it.
    fn time_exceeded_packet(id: u16, sequence: u16, probe_dest: Ipv4Addr) -> Vec<u8> {
        let quoted_echo = echo_request(
            id,
            sequence,
            PING_PAYLOAD_LENGTH,
            &IpAddr::V4(probe_dest),
            IpVersion::V4,
        );

        let mut quoted_ip = vec![0u8; 20];
        quoted_ip[0] = 0x45;
        quoted_ip[2..4].copy_from_slice(&((20 + quoted_echo.len()) as u16).to_be_bytes());
        quoted_ip[8] = 1;
        quoted_ip[9] = 1;
        quoted_ip[12..16].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
        quoted_ip[16..20].copy_from_slice(&probe_dest.octets());
        quoted_ip.extend_from_slice(&quoted_echo);

        let mut message = vec![0u8; 8 + quoted_ip.len()];
        message[0] = 11;
        message[8..].copy_from_slice(&quoted_ip);
        let checksum = pingpath_packet::rfc1071_checksum(&message);
        message[2..4].copy_from_slice(&checksum.to_be_bytes());
        message
    }

    fn echo_reply_packet(id: u16, sequence: u16) -> Vec<u8> {
        let mut message = vec![0u8; 8 + PING_PAYLOAD_LENGTH];
        message[0] = 0;
        message[4..6].copy_from_slice(&id.to_be_bytes());
        message[6..8].copy_from_slice(&sequence.to_be_bytes());
        let checksum = pingpath_packet::rfc1071_checksum(&message);
        message[2..4].copy_from_slice(&checksum.to_be_bytes());
        message
    }

    #[test]
    fn time_exceeded_is_correlated_and_reported_ok() {
        let (sender, _factory, engine) = scripted_engine();
        let results = engine.results();

        let probe_dest = Ipv4Addr::new(192, 0, 2, 1);
        let target = engine
            .add_target_with_ttl(IpAddr::V4(probe_dest), 3)
            .expect("target");
        engine.shared().transmit_round();

        // First probe of a fresh target carries sequence 1.
        let packet = time_exceeded_packet(target.id(), 1, probe_dest);
        sender
            .send((packet, IpAddr::V4(OUTER_SOURCE)))
            .expect("scripted send");

        let result = results
            .recv_timeout(Duration::from_secs(2))
            .expect("result emitted");
        assert_eq!(result.code, PingResultCode::Ok);
        assert_eq!(result.reply_address, Some(IpAddr::V4(OUTER_SOURCE)));
        assert_eq!(result.sample_number, 0);
        assert!(Arc::ptr_eq(&result.target, &target));
    }

    #[test]
    fn late_reply_after_timeout_is_dropped() {
        let (sender, _factory, engine) = scripted_engine();
        let results = engine.results();

        let target = engine
            .add_target(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)))
            .expect("target");
        engine.set_timeout(Duration::ZERO);
        engine.shared().transmit_round();

        // The scanner claims the probe first.
        engine.shared().sweep_timeouts();
        let result = results
            .recv_timeout(Duration::from_secs(1))
            .expect("timeout result");
        assert_eq!(result.code, PingResultCode::NoReply);
        assert_eq!(result.reply_address, None);

        // A matching reply arriving afterwards must not produce a second
        // result for the same sample.
        sender
            .send((
                echo_reply_packet(target.id(), 1),
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)),
            ))
            .expect("scripted send");
        assert!(results.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn reply_then_sweep_emits_exactly_one_result() {
        let (sender, _factory, engine) = scripted_engine();
        let results = engine.results();

        let target = engine
            .add_target(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)))
            .expect("target");
        engine.shared().transmit_round();

        sender
            .send((
                echo_reply_packet(target.id(), 1),
                IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
            ))
            .expect("scripted send");

        let result = results
            .recv_timeout(Duration::from_secs(2))
            .expect("reply result");
        assert_eq!(result.code, PingResultCode::Ok);
        assert!(result.round_trip >= Duration::ZERO);

        // Even with a zero timeout the sweep finds nothing to reap.
        engine.set_timeout(Duration::ZERO);
        engine.shared().sweep_timeouts();
        assert!(results.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn foreign_and_invalid_packets_are_ignored() {
        let (sender, _factory, engine) = scripted_engine();
        let results = engine.results();

        engine
            .add_target(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3)))
            .expect("target");
        engine.shared().transmit_round();

        let source = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3));
        // Unknown correlation key.
        sender
            .send((echo_reply_packet(0x7777, 0x7777), source))
            .expect("scripted send");
        // Garbage.
        sender.send((vec![0xff; 24], source)).expect("scripted send");

        assert!(results.recv_timeout(Duration::from_millis(400)).is_err());
    }

    #[test]
    fn removed_target_is_no_longer_probed() {
        let (_sender, _factory, engine) = scripted_engine();

        let target = engine
            .add_target(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 8)))
            .expect("target");
        engine.shared().transmit_round();
        assert!(engine.remove_target(&target));
        engine.shared().transmit_round();

        // Only the pre-removal probe is outstanding.
        let outstanding = engine
            .shared()
            .requests
            .lock()
            .expect("request table mutex poisoned")
            .len();
        assert_eq!(outstanding, 1);

        // A target the engine never knew is reported as such.
        let foreign = Arc::new(PingTarget::new(
            IpAddr::V4(Ipv4Addr::new(192, 0, 2, 200)),
            0,
            Box::new(crate::receiver::tests_support::NullSocket::new(IpVersion::V4)),
        ));
        assert!(!engine.remove_target(&foreign));
    }

    #[test]
    fn interval_change_takes_effect_mid_flight() {
        let (_sender, _factory, engine) = scripted_engine();

        engine
            .add_target(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4)))
            .expect("target");
        engine.set_interval(Duration::from_secs(3600));
        assert!(engine.start());

        // Let the first round go out, then tighten the interval.
        thread::sleep(Duration::from_millis(300));
        engine.set_interval(Duration::from_millis(100));
        thread::sleep(Duration::from_millis(1500));
        engine.stop();

        let sent = {
            let targets = engine.shared().targets.lock().unwrap();
            targets[0].next_sample_number()
        };
        // One immediate round plus at least eight at the tightened
        // interval over 1.5 s.
        assert!(sent >= 9, "only {sent} probes were sent");
    }

    #[test]
    fn stop_drains_outstanding_requests_silently() {
        let (_sender, _factory, engine) = scripted_engine();
        let results = engine.results();

        engine
            .add_target(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 6)))
            .expect("target");
        engine.shared().transmit_round();
        assert!(engine.start());
        assert!(engine.stop());

        let outstanding = engine
            .shared()
            .requests
            .lock()
            .expect("request table mutex poisoned")
            .len();
        assert_eq!(outstanding, 0);
        assert!(results.try_recv().is_err());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let (_sender, _factory, engine) = scripted_engine();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(engine.add_target(v6).is_err());
    }

    #[test]
    fn configuration_round_trips_interval_and_epoch() {
        let (_sender, _factory, engine) = scripted_engine();

        engine.set_interval(Duration::from_millis(250));
        let epoch = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        engine.set_epoch(epoch);
        let saved = engine.save_configuration();

        let (_sender2, provider) = ScriptedProvider::new(IpVersion::V4);
        let factory = PingEngineFactory::with_provider(provider);
        let restored = factory.create(IpVersion::V4).expect("engine");
        assert!(restored.load_configuration(&saved));
        assert_eq!(restored.interval(), Duration::from_millis(250));
        assert_eq!(restored.epoch(), epoch);

        // Unknown keys are ignored, missing keys keep defaults.
        assert!(restored.load_configuration(&json!({"palette": "dark"})));
        assert_eq!(restored.interval(), Duration::from_millis(250));
    }
}
