//! The discovery worker.

use hickory_resolver::Resolver;
use pingpath_core::{
    EngineError, EngineResult, IpVersion, RouteList, DEFAULT_REPLY_TIMEOUT_MS, MAX_ROUTE_HOPS,
    PING_PAYLOAD_LENGTH, TRANSMIT_RETRIES,
};
use pingpath_packet::{echo_request, IcmpKind, IcmpPacket};
use pingpath_socket::{local_address_for, SocketProvider, RECEIVE_BUFFER_SIZE};
use rand::Rng;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Outcome of one discovery request.
#[derive(Debug, Clone)]
pub struct RouteResult {
    /// The resolved destination; `None` when resolution failed.
    pub target: Option<IpAddr>,
    /// Hop addresses indexed by TTL − 1. Empty when discovery failed.
    pub route: RouteList,
}

pub(crate) struct RouteWorker {
    host: String,
    version: IpVersion,
    sockets: Arc<dyn SocketProvider>,
    running: Arc<AtomicBool>,
}

impl RouteWorker {
    pub fn new(
        host: String,
        version: IpVersion,
        sockets: Arc<dyn SocketProvider>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            host,
            version,
            sockets,
            running,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Resolves the host and returns its first address of the requested
    /// version.
    fn resolve(&self) -> EngineResult<IpAddr> {
        if let Ok(literal) = self.host.parse::<IpAddr>() {
            if self.version.matches(&literal) {
                return Ok(literal);
            }
            return Err(EngineError::NoAddress {
                hostname: self.host.clone(),
                version: self.version,
            });
        }

        let resolver = Resolver::from_system_conf().map_err(|err| EngineError::ResolveFailed {
            hostname: self.host.clone(),
            source: Box::new(err),
        })?;
        let lookup = resolver
            .lookup_ip(self.host.as_str())
            .map_err(|err| EngineError::ResolveFailed {
                hostname: self.host.clone(),
                source: Box::new(err),
            })?;
        lookup
            .iter()
            .find(|addr| self.version.matches(addr))
            .ok_or_else(|| EngineError::NoAddress {
                hostname: self.host.clone(),
                version: self.version,
            })
    }

    /// Probes one hop with a fresh write socket so the TTL can never leak
    /// into the next hop. Returns the responding address and whether it
    /// was the destination, or `None` when the reply budget ran out.
    fn probe_hop(&self, target: &IpAddr, hop: u8) -> EngineResult<Option<(IpAddr, bool)>> {
        let socket = self.sockets.write_socket(hop, self.version)?;
        let mut rng = rand::thread_rng();
        let id: u16 = rng.gen_range(1..=u16::MAX);
        let sequence_base: u16 = rng.gen();
        let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

        for attempt in 1..=TRANSMIT_RETRIES {
            if !self.is_running() {
                break;
            }

            let sequence = sequence_base.wrapping_add(attempt);
            let probe = echo_request(id, sequence, PING_PAYLOAD_LENGTH, target, self.version);
            match socket.send_to(&probe, target) {
                Ok(sent) if sent == probe.len() => {}
                Ok(_) | Err(_) => {
                    error!(host = %target, hop, "error sending the echo request");
                    continue;
                }
            }

            let mut remaining = Duration::from_millis(DEFAULT_REPLY_TIMEOUT_MS);
            while !remaining.is_zero() {
                let started = Instant::now();
                let (length, source) = match socket.recv_from(&mut buffer, remaining) {
                    Ok(read) => read,
                    Err(_) => break,
                };

                if let Some(packet) = self.decode(&buffer[..length], &source) {
                    if packet.id() == id && packet.sequence() == sequence {
                        match packet.kind() {
                            IcmpKind::EchoReply => return Ok(Some((source, true))),
                            IcmpKind::TimeExceeded => return Ok(Some((source, false))),
                            // Our own outgoing request, visible on loopback.
                            IcmpKind::EchoRequest | IcmpKind::Invalid => {}
                        }
                    }
                }

                remaining = remaining.saturating_sub(started.elapsed());
            }
        }

        Ok(None)
    }

    /// Decodes one received datagram. The v6 checksum needs the address
    /// the datagram was sent to, recovered from the local route back to
    /// the source; sources we have no route toward cannot be verified.
    fn decode(&self, buffer: &[u8], source: &IpAddr) -> Option<IcmpPacket> {
        let destination = match self.version {
            IpVersion::V4 => self.version.unspecified(),
            IpVersion::V6 => local_address_for(source).ok()?,
        };
        Some(IcmpPacket::from_bytes(
            buffer,
            self.version,
            source,
            &destination,
        ))
    }

    pub fn run(self, sender: mpsc::Sender<RouteResult>) {
        let target = match self.resolve() {
            Ok(target) => target,
            Err(err) => {
                error!(host = %self.host, error = %err, "failed to resolve discovery target");
                let _ = sender.send(RouteResult {
                    target: None,
                    route: Vec::new(),
                });
                return;
            }
        };

        let mut route: RouteList = Vec::new();
        let mut complete = false;
        let mut hop: u8 = 1;

        while !complete && hop <= MAX_ROUTE_HOPS && self.is_running() {
            match self.probe_hop(&target, hop) {
                Ok(Some((address, reached))) => {
                    trace!(
                        hop,
                        %address,
                        "hop responded with {}",
                        if reached { "echo" } else { "TTL exceeded" }
                    );
                    route.push(Some(address));
                    complete = reached;
                }
                Ok(None) => {
                    trace!(hop, "hop timed out");
                    route.push(None);
                }
                Err(err) => {
                    error!(host = %self.host, hop, error = %err, "route discovery aborted");
                    let _ = sender.send(RouteResult {
                        target: Some(target),
                        route: Vec::new(),
                    });
                    return;
                }
            }
            hop += 1;
        }

        if !self.is_running() {
            // Cancelled; aborts are not reported.
            return;
        }

        if complete {
            trace!(host = %self.host, %target, hops = route.len(), "route discovery completed");
            let _ = sender.send(RouteResult {
                target: Some(target),
                route,
            });
        } else {
            error!(host = %self.host, "failed to discover route");
            let _ = sender.send(RouteResult {
                target: Some(target),
                route: Vec::new(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RouteEngine;
    use pingpath_core::EngineResult;
    use pingpath_packet::rfc1071_checksum;
    use pingpath_socket::ProbeSocket;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::thread;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    fn echo_reply_packet(id: u16, sequence: u16) -> Vec<u8> {
        let mut message = vec![0u8; 8 + PING_PAYLOAD_LENGTH];
        message[0] = 0;
        message[4..6].copy_from_slice(&id.to_be_bytes());
        message[6..8].copy_from_slice(&sequence.to_be_bytes());
        let checksum = rfc1071_checksum(&message);
        message[2..4].copy_from_slice(&checksum.to_be_bytes());
        message
    }

    fn time_exceeded_packet(id: u16, sequence: u16) -> Vec<u8> {
        let quoted_echo = echo_request(
            id,
            sequence,
            PING_PAYLOAD_LENGTH,
            &IpAddr::V4(TARGET),
            IpVersion::V4,
        );
        let mut quoted_ip = vec![0u8; 20];
        quoted_ip[0] = 0x45;
        quoted_ip[2..4].copy_from_slice(&((20 + quoted_echo.len()) as u16).to_be_bytes());
        quoted_ip[8] = 1;
        quoted_ip[9] = 1;
        quoted_ip[16..20].copy_from_slice(&TARGET.octets());
        quoted_ip.extend_from_slice(&quoted_echo);

        let mut message = vec![0u8; 8 + quoted_ip.len()];
        message[0] = 11;
        message[8..].copy_from_slice(&quoted_ip);
        let checksum = rfc1071_checksum(&message);
        message[2..4].copy_from_slice(&checksum.to_be_bytes());
        message
    }

    /// A hop of a scripted three-hop path: responds to whatever probe was
    /// last sent on it, the way the matching router would.
    struct ScriptedHopSocket {
        ttl: u8,
        path_length: u8,
        silent_hop: Option<u8>,
        all_silent: bool,
        last_probe: Mutex<Option<(u16, u16)>>,
    }

    impl ProbeSocket for ScriptedHopSocket {
        fn send_to(&self, buffer: &[u8], _host: &IpAddr) -> io::Result<usize> {
            let unspecified = IpVersion::V4.unspecified();
            let probe = IcmpPacket::from_bytes(buffer, IpVersion::V4, &unspecified, &unspecified);
            assert_eq!(probe.kind(), IcmpKind::EchoRequest);
            *self.last_probe.lock().unwrap() = Some((probe.id(), probe.sequence()));
            Ok(buffer.len())
        }

        fn recv_from(&self, buffer: &mut [u8], timeout: Duration) -> io::Result<(usize, IpAddr)> {
            if self.all_silent || self.silent_hop == Some(self.ttl) {
                thread::sleep(timeout.min(Duration::from_millis(50)));
                return Err(io::Error::new(io::ErrorKind::TimedOut, "silent hop"));
            }
            let (id, sequence) = self
                .last_probe
                .lock()
                .unwrap()
                .expect("probe received before any send");

            let (packet, source) = if self.ttl >= self.path_length {
                (echo_reply_packet(id, sequence), IpAddr::V4(TARGET))
            } else {
                (
                    time_exceeded_packet(id, sequence),
                    IpAddr::V4(Ipv4Addr::new(10, 0, 0, self.ttl)),
                )
            };
            buffer[..packet.len()].copy_from_slice(&packet);
            Ok((packet.len(), source))
        }

        fn set_ttl(&self, _ttl: u8) -> io::Result<()> {
            Ok(())
        }

        fn version(&self) -> IpVersion {
            IpVersion::V4
        }
    }

    struct ScriptedPathProvider {
        path_length: u8,
        silent_hop: Option<u8>,
        all_silent: bool,
    }

    impl ScriptedPathProvider {
        fn path(path_length: u8) -> Self {
            Self {
                path_length,
                silent_hop: None,
                all_silent: false,
            }
        }
    }

    impl SocketProvider for ScriptedPathProvider {
        fn read_socket(&self, _version: IpVersion) -> EngineResult<Box<dyn ProbeSocket>> {
            unreachable!("route discovery only opens write sockets")
        }

        fn write_socket(&self, ttl: u8, _version: IpVersion) -> EngineResult<Box<dyn ProbeSocket>> {
            Ok(Box::new(ScriptedHopSocket {
                ttl,
                path_length: self.path_length,
                silent_hop: self.silent_hop,
                all_silent: self.all_silent,
                last_probe: Mutex::new(None),
            }))
        }
    }

    #[test]
    fn discovers_a_three_hop_path() {
        let engine = RouteEngine::with_provider(Arc::new(ScriptedPathProvider::path(3)));

        let result = engine
            .discover("192.0.2.1", IpVersion::V4)
            .recv_timeout(Duration::from_secs(5))
            .expect("route result");

        assert_eq!(result.target, Some(IpAddr::V4(TARGET)));
        assert_eq!(
            result.route,
            vec![
                Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
                Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
                Some(IpAddr::V4(TARGET)),
            ]
        );
    }

    #[test]
    fn silent_hop_is_reported_as_unspecified() {
        let engine = RouteEngine::with_provider(Arc::new(ScriptedPathProvider {
            path_length: 3,
            silent_hop: Some(2),
            all_silent: false,
        }));

        let result = engine
            .discover("192.0.2.1", IpVersion::V4)
            .recv_timeout(Duration::from_secs(10))
            .expect("route result");

        assert_eq!(result.route.len(), 3);
        assert!(result.route[0].is_some());
        assert_eq!(result.route[1], None);
        assert_eq!(result.route[2], Some(IpAddr::V4(TARGET)));
    }

    #[test]
    fn version_mismatch_reports_failure() {
        let engine = RouteEngine::with_provider(Arc::new(ScriptedPathProvider::path(1)));

        let result = engine
            .discover("::1", IpVersion::V4)
            .recv_timeout(Duration::from_secs(5))
            .expect("route result");

        assert_eq!(result.target, None);
        assert!(result.route.is_empty());
    }

    #[test]
    fn cancelled_discovery_emits_nothing() {
        let engine = RouteEngine::with_provider(Arc::new(ScriptedPathProvider {
            path_length: 64,
            silent_hop: None,
            all_silent: true,
        }));

        let receiver = engine.discover("192.0.2.1", IpVersion::V4);
        engine.stop();

        // The worker exits at a loop head without sending; the channel
        // just disconnects.
        match receiver.recv_timeout(Duration::from_secs(10)) {
            Err(_) => {}
            Ok(result) => panic!("cancelled discovery still produced {result:?}"),
        }
    }
}
