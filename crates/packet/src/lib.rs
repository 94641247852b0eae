//! ICMP packet encoding and decoding.
//!
//! Builds ICMP Echo Requests for both IP versions and decodes the three
//! packet shapes the measurement path cares about: Echo Reply, Time
//! Exceeded, and (for loopback of our own probes) Echo Request. Everything
//! else decodes to [`IcmpKind::Invalid`] and is dropped by callers.

use pingpath_core::IpVersion;
use std::net::{IpAddr, Ipv6Addr};

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

const ICMPV6_PROTOCOL: u8 = 58;

const IPV4_HEADER_MIN_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const ICMP_HEADER_LEN: usize = 8;

/// Decoded shape of a received ICMP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpKind {
    EchoRequest,
    EchoReply,
    TimeExceeded,
    Invalid,
}

/// A decoded ICMP packet.
///
/// For `TimeExceeded` the identifier and sequence come from the quoted
/// echo request inside the ICMP error body, not from the outer header, so
/// the correlation key always refers to the probe that triggered the
/// response.
#[derive(Debug, Clone)]
pub struct IcmpPacket {
    kind: IcmpKind,
    id: u16,
    sequence: u16,
    payload: Vec<u8>,
}

impl IcmpPacket {
    pub fn kind(&self) -> IcmpKind {
        self.kind
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn invalid() -> Self {
        Self {
            kind: IcmpKind::Invalid,
            id: 0,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Decodes a received datagram.
    ///
    /// `source` and `destination` are the addresses the datagram was
    /// received from and sent to; the v6 checksum is verified against the
    /// pseudo-header rebuilt from them. V4 buffers may carry the leading
    /// IP header (raw and datagram ICMP sockets deliver it); it is
    /// skipped using the IHL nibble. V6 buffers start at the ICMPv6
    /// header because the kernel strips the IP header.
    pub fn from_bytes(
        buffer: &[u8],
        version: IpVersion,
        source: &IpAddr,
        destination: &IpAddr,
    ) -> Self {
        match version {
            IpVersion::V4 => Self::from_bytes_v4(buffer),
            IpVersion::V6 => match (source, destination) {
                (IpAddr::V6(source), IpAddr::V6(destination)) => {
                    Self::from_bytes_v6(buffer, source, destination)
                }
                _ => Self::invalid(),
            },
        }
    }

    fn from_bytes_v4(buffer: &[u8]) -> Self {
        let message = match strip_ipv4_header(buffer) {
            Some(message) => message,
            None => return Self::invalid(),
        };
        if message.len() < ICMP_HEADER_LEN {
            return Self::invalid();
        }
        if rfc1071_checksum(message) != 0 {
            return Self::invalid();
        }
        match (message[0], message[1]) {
            (ICMP_ECHO_REPLY, 0) => Self::echo_fields(IcmpKind::EchoReply, message),
            (ICMP_ECHO_REQUEST, 0) => Self::echo_fields(IcmpKind::EchoRequest, message),
            (ICMP_TIME_EXCEEDED, 0) => Self::quoted_fields_v4(&message[ICMP_HEADER_LEN..]),
            _ => Self::invalid(),
        }
    }

    fn from_bytes_v6(buffer: &[u8], source: &Ipv6Addr, destination: &Ipv6Addr) -> Self {
        if buffer.len() < ICMP_HEADER_LEN {
            return Self::invalid();
        }
        if icmpv6_checksum(source, destination, buffer) != 0 {
            return Self::invalid();
        }
        match (buffer[0], buffer[1]) {
            (ICMPV6_ECHO_REPLY, 0) => Self::echo_fields(IcmpKind::EchoReply, buffer),
            (ICMPV6_ECHO_REQUEST, 0) => Self::echo_fields(IcmpKind::EchoRequest, buffer),
            (ICMPV6_TIME_EXCEEDED, 0) => Self::quoted_fields_v6(&buffer[4..]),
            _ => Self::invalid(),
        }
    }

    fn echo_fields(kind: IcmpKind, message: &[u8]) -> Self {
        Self {
            kind,
            id: u16::from_be_bytes([message[4], message[5]]),
            sequence: u16::from_be_bytes([message[6], message[7]]),
            payload: message[ICMP_HEADER_LEN..].to_vec(),
        }
    }

    /// Walks the quoted IP header inside a v4 Time Exceeded body and reads
    /// the identifier and sequence of the echo request that expired.
    fn quoted_fields_v4(body: &[u8]) -> Self {
        if body.is_empty() || body[0] >> 4 != 4 {
            return Self::invalid();
        }
        let header_len = (body[0] & 0x0f) as usize * 4;
        if header_len < IPV4_HEADER_MIN_LEN || body.len() < header_len + ICMP_HEADER_LEN {
            return Self::invalid();
        }
        let inner = &body[header_len..];
        if inner[0] != ICMP_ECHO_REQUEST {
            return Self::invalid();
        }
        Self {
            kind: IcmpKind::TimeExceeded,
            id: u16::from_be_bytes([inner[4], inner[5]]),
            sequence: u16::from_be_bytes([inner[6], inner[7]]),
            payload: inner[ICMP_HEADER_LEN..].to_vec(),
        }
    }

    fn quoted_fields_v6(body: &[u8]) -> Self {
        let embedded = match locate_embedded_ipv6(body) {
            Some(embedded) => embedded,
            None => return Self::invalid(),
        };
        if embedded.len() < IPV6_HEADER_LEN + ICMP_HEADER_LEN {
            return Self::invalid();
        }
        if embedded[6] != ICMPV6_PROTOCOL {
            return Self::invalid();
        }
        let inner = &embedded[IPV6_HEADER_LEN..];
        if inner[0] != ICMPV6_ECHO_REQUEST {
            return Self::invalid();
        }
        Self {
            kind: IcmpKind::TimeExceeded,
            id: u16::from_be_bytes([inner[4], inner[5]]),
            sequence: u16::from_be_bytes([inner[6], inner[7]]),
            payload: inner[ICMP_HEADER_LEN..].to_vec(),
        }
    }
}

/// Builds an ICMP Echo Request ready to hand to `sendto`.
///
/// The payload is a deterministic rolling byte pattern of `payload_len`
/// bytes. For v6 the checksum covers the pseudo-header with an unspecified
/// source; the kernel rewrites it with the real source on send.
pub fn echo_request(
    id: u16,
    sequence: u16,
    payload_len: usize,
    destination: &IpAddr,
    version: IpVersion,
) -> Vec<u8> {
    let mut message = vec![0u8; ICMP_HEADER_LEN + payload_len];
    message[0] = match version {
        IpVersion::V4 => ICMP_ECHO_REQUEST,
        IpVersion::V6 => ICMPV6_ECHO_REQUEST,
    };
    message[4..6].copy_from_slice(&id.to_be_bytes());
    message[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (offset, byte) in message[ICMP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = offset as u8;
    }

    let checksum = match (version, destination) {
        (IpVersion::V6, IpAddr::V6(dst)) => {
            icmpv6_checksum(&Ipv6Addr::UNSPECIFIED, dst, &message)
        }
        _ => rfc1071_checksum(&message),
    };
    message[2..4].copy_from_slice(&checksum.to_be_bytes());
    message
}

/// Skips a leading IPv4 header when one is present.
///
/// Bare ICMP messages never start with nibble 4 (the interesting types are
/// 0, 8, and 11), so the sniff is unambiguous.
fn strip_ipv4_header(buffer: &[u8]) -> Option<&[u8]> {
    if buffer.is_empty() {
        return None;
    }
    if buffer[0] >> 4 != 4 {
        return Some(buffer);
    }
    let header_len = (buffer[0] & 0x0f) as usize * 4;
    if header_len < IPV4_HEADER_MIN_LEN || buffer.len() < header_len {
        return None;
    }
    Some(&buffer[header_len..])
}

/// Locates the quoted IPv6 header inside a Time Exceeded body. Some stacks
/// deliver the body with the 4 unused bytes already consumed.
fn locate_embedded_ipv6(body: &[u8]) -> Option<&[u8]> {
    if body.first().map(|byte| byte >> 4 == 6).unwrap_or(false) {
        return Some(body);
    }
    if body.len() >= 5 && body[4] >> 4 == 6 {
        return Some(&body[4..]);
    }
    None
}

/// RFC 1071 ones'-complement checksum.
///
/// Verification property: summing a message that already carries its
/// checksum yields 0.
pub fn rfc1071_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&tail) = chunks.remainder().first() {
        sum += u32::from(tail) << 8;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 checksum over the ICMPv6 pseudo-header and message.
pub fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, message: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(40 + message.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.extend_from_slice(&(message.len() as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0]);
    pseudo.push(ICMPV6_PROTOCOL);
    pseudo.extend_from_slice(message);
    rfc1071_checksum(&pseudo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn v4_dest() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))
    }

    fn v6_dest() -> IpAddr {
        IpAddr::V6("2001:db8::1".parse().unwrap())
    }

    fn v6_unspecified() -> IpAddr {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }

    /// The v4 path ignores the endpoint addresses; any pair will do.
    fn parse_v4(buffer: &[u8]) -> IcmpPacket {
        IcmpPacket::from_bytes(buffer, IpVersion::V4, &v4_dest(), &v4_dest())
    }

    fn build_ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
        let mut header = vec![0u8; IPV4_HEADER_MIN_LEN];
        header[0] = 0x45;
        header[2..4]
            .copy_from_slice(&((IPV4_HEADER_MIN_LEN + payload_len) as u16).to_be_bytes());
        header[8] = 64;
        header[9] = 1;
        header[12..16].copy_from_slice(&src.octets());
        header[16..20].copy_from_slice(&dst.octets());
        let checksum = rfc1071_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        header
    }

    fn build_icmpv4_message(icmp_type: u8, id: u16, seq: u16, body: &[u8]) -> Vec<u8> {
        let mut message = vec![0u8; ICMP_HEADER_LEN + body.len()];
        message[0] = icmp_type;
        message[4..6].copy_from_slice(&id.to_be_bytes());
        message[6..8].copy_from_slice(&seq.to_be_bytes());
        message[ICMP_HEADER_LEN..].copy_from_slice(body);
        let checksum = rfc1071_checksum(&message);
        message[2..4].copy_from_slice(&checksum.to_be_bytes());
        message
    }

    #[test]
    fn echo_request_round_trips_v4() {
        let buffer = echo_request(0x1234, 0x0042, 52, &v4_dest(), IpVersion::V4);
        assert_eq!(buffer.len(), ICMP_HEADER_LEN + 52);

        let packet = parse_v4(&buffer);
        assert_eq!(packet.kind(), IcmpKind::EchoRequest);
        assert_eq!(packet.id(), 0x1234);
        assert_eq!(packet.sequence(), 0x0042);
        assert_eq!(packet.payload().len(), 52);
    }

    #[test]
    fn echo_request_round_trips_v6() {
        // The builder computes its checksum with the unspecified source,
        // so the same pair verifies it.
        let buffer = echo_request(0xbeef, 0x7777, 52, &v6_dest(), IpVersion::V6);
        let packet =
            IcmpPacket::from_bytes(&buffer, IpVersion::V6, &v6_unspecified(), &v6_dest());
        assert_eq!(packet.kind(), IcmpKind::EchoRequest);
        assert_eq!(packet.id(), 0xbeef);
        assert_eq!(packet.sequence(), 0x7777);
    }

    #[test]
    fn reply_parses_behind_ip_header() {
        let reply = build_icmpv4_message(ICMP_ECHO_REPLY, 0x1001, 9, &[0xaa; 16]);
        let mut datagram =
            build_ipv4_header(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), reply.len());
        datagram.extend_from_slice(&reply);

        let packet = parse_v4(&datagram);
        assert_eq!(packet.kind(), IcmpKind::EchoReply);
        assert_eq!(packet.id(), 0x1001);
        assert_eq!(packet.sequence(), 9);
    }

    #[test]
    fn time_exceeded_reads_inner_header_v4() {
        let quoted_echo = echo_request(0x1234, 0x0001, 8, &v4_dest(), IpVersion::V4);
        let mut quoted = build_ipv4_header(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(192, 0, 2, 1),
            quoted_echo.len(),
        );
        quoted.extend_from_slice(&quoted_echo);

        let exceeded = build_icmpv4_message(ICMP_TIME_EXCEEDED, 0, 0, &quoted);
        let packet = parse_v4(&exceeded);
        assert_eq!(packet.kind(), IcmpKind::TimeExceeded);
        assert_eq!(packet.id(), 0x1234);
        assert_eq!(packet.sequence(), 0x0001);
    }

    #[test]
    fn time_exceeded_reads_inner_header_v6() {
        // local → dst is the expired probe; router answers local.
        let local: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let router: Ipv6Addr = "2001:db8::ff".parse().unwrap();
        let quoted_echo = echo_request(0x4242, 0x0007, 8, &IpAddr::V6(dst), IpVersion::V6);

        let mut quoted = vec![0u8; IPV6_HEADER_LEN];
        quoted[0] = 0x60;
        quoted[4..6].copy_from_slice(&(quoted_echo.len() as u16).to_be_bytes());
        quoted[6] = ICMPV6_PROTOCOL;
        quoted[7] = 1;
        quoted[8..24].copy_from_slice(&local.octets());
        quoted[24..40].copy_from_slice(&dst.octets());
        quoted.extend_from_slice(&quoted_echo);

        let mut exceeded = vec![ICMPV6_TIME_EXCEEDED, 0, 0, 0, 0, 0, 0, 0];
        exceeded.extend_from_slice(&quoted);
        let checksum = icmpv6_checksum(&router, &local, &exceeded);
        exceeded[2..4].copy_from_slice(&checksum.to_be_bytes());

        let packet = IcmpPacket::from_bytes(
            &exceeded,
            IpVersion::V6,
            &IpAddr::V6(router),
            &IpAddr::V6(local),
        );
        assert_eq!(packet.kind(), IcmpKind::TimeExceeded);
        assert_eq!(packet.id(), 0x4242);
        assert_eq!(packet.sequence(), 0x0007);
    }

    #[test]
    fn corrupted_checksum_is_invalid() {
        let mut buffer = echo_request(0x1234, 0x0042, 52, &v4_dest(), IpVersion::V4);
        for bit in 0..8 {
            buffer[12] ^= 1 << bit;
            assert_eq!(parse_v4(&buffer).kind(), IcmpKind::Invalid);
            buffer[12] ^= 1 << bit;
        }
        // Sanity check the untouched buffer still decodes.
        assert_eq!(parse_v4(&buffer).kind(), IcmpKind::EchoRequest);
    }

    #[test]
    fn corrupted_checksum_is_invalid_v6() {
        let mut buffer = echo_request(0xbeef, 0x7777, 52, &v6_dest(), IpVersion::V6);
        for bit in 0..8 {
            buffer[12] ^= 1 << bit;
            let packet =
                IcmpPacket::from_bytes(&buffer, IpVersion::V6, &v6_unspecified(), &v6_dest());
            assert_eq!(packet.kind(), IcmpKind::Invalid);
            buffer[12] ^= 1 << bit;
        }
        assert_eq!(
            IcmpPacket::from_bytes(&buffer, IpVersion::V6, &v6_unspecified(), &v6_dest()).kind(),
            IcmpKind::EchoRequest
        );

        // The same bytes fail verification against the wrong endpoints.
        let elsewhere = IpAddr::V6("2001:db8::dead".parse().unwrap());
        assert_eq!(
            IcmpPacket::from_bytes(&buffer, IpVersion::V6, &v6_unspecified(), &elsewhere).kind(),
            IcmpKind::Invalid
        );
    }

    #[test]
    fn unknown_types_are_invalid() {
        // Destination unreachable is not part of the measurement model.
        let unreachable = build_icmpv4_message(3, 1, 1, &[0u8; 32]);
        assert_eq!(parse_v4(&unreachable).kind(), IcmpKind::Invalid);
    }

    #[test]
    fn truncated_buffers_are_invalid() {
        assert_eq!(parse_v4(&[]).kind(), IcmpKind::Invalid);
        assert_eq!(parse_v4(&[0x45, 0, 0]).kind(), IcmpKind::Invalid);
        assert_eq!(
            IcmpPacket::from_bytes(
                &[ICMPV6_ECHO_REPLY, 0, 0],
                IpVersion::V6,
                &v6_unspecified(),
                &v6_dest()
            )
            .kind(),
            IcmpKind::Invalid
        );

        // A v6 parse without v6 endpoints cannot verify anything.
        let buffer = echo_request(0x0101, 0x0202, 8, &v6_dest(), IpVersion::V6);
        assert_eq!(
            IcmpPacket::from_bytes(&buffer, IpVersion::V6, &v4_dest(), &v4_dest()).kind(),
            IcmpKind::Invalid
        );
    }

    #[test]
    fn checksum_folds_carries() {
        // 0xffff + 0x0002 carries out of 16 bits and folds to 0x0002.
        let data = [0xff, 0xff, 0x00, 0x02];
        assert_eq!(rfc1071_checksum(&data), !0x0002u16);
    }

    #[test]
    fn checksum_handles_odd_length() {
        let even = rfc1071_checksum(&[0x12, 0x34]);
        let odd = rfc1071_checksum(&[0x12, 0x34, 0x56]);
        assert_ne!(even, odd);
    }
}
