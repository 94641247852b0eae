//! Cross-platform ICMP socket layer.
//!
//! The rest of the system talks to sockets through [`ProbeSocket`] and
//! obtains them through a [`SocketProvider`], so engines and workers can be
//! driven by mock sockets in tests. [`IcmpSocket`] is the real
//! implementation; platform differences (raw vs datagram ICMP, poll vs
//! WSAPoll) are confined to the platform modules.

use pingpath_core::{EngineResult, IpVersion};
use std::io;
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::IcmpSocket;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::IcmpSocket;

/// A socket capable of sending and receiving ICMP datagrams.
pub trait ProbeSocket: Send + Sync {
    /// Sends `buffer` to `host`. Returns the number of bytes sent.
    fn send_to(&self, buffer: &[u8], host: &IpAddr) -> io::Result<usize>;

    /// Waits up to `timeout` for a datagram, returning the number of bytes
    /// read and the source address. A quiet interval surfaces as
    /// [`io::ErrorKind::TimedOut`]; callers that need to distinguish a
    /// timeout from a failed read can also compare elapsed time against
    /// `timeout`.
    fn recv_from(&self, buffer: &mut [u8], timeout: Duration) -> io::Result<(usize, IpAddr)>;

    /// Sets the IP TTL (v4) or unicast hop limit (v6) for outgoing packets.
    fn set_ttl(&self, ttl: u8) -> io::Result<()>;

    fn version(&self) -> IpVersion;
}

/// Creates the sockets an engine needs.
///
/// The system provider opens real ICMP sockets; tests substitute their own
/// implementation to drive engines without privileges or a network.
pub trait SocketProvider: Send + Sync {
    fn read_socket(&self, version: IpVersion) -> EngineResult<Box<dyn ProbeSocket>>;
    fn write_socket(&self, ttl: u8, version: IpVersion) -> EngineResult<Box<dyn ProbeSocket>>;
}

/// [`SocketProvider`] backed by [`IcmpSocket`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSocketProvider;

impl SocketProvider for SystemSocketProvider {
    fn read_socket(&self, version: IpVersion) -> EngineResult<Box<dyn ProbeSocket>> {
        Ok(Box::new(IcmpSocket::create_read_socket(version)?))
    }

    fn write_socket(&self, ttl: u8, version: IpVersion) -> EngineResult<Box<dyn ProbeSocket>> {
        Ok(Box::new(IcmpSocket::create_write_socket(ttl, version)?))
    }
}

/// Receive buffer sized for any ICMP datagram we care about.
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Local address the host would use to reach `remote`.
///
/// Shared ICMP sockets report only the source of a received datagram;
/// receive paths use this to recover the address the datagram was sent
/// to, which the ICMPv6 pseudo-header needs for checksum verification.
/// Connecting a UDP socket performs the route lookup without sending
/// anything.
pub fn local_address_for(remote: &IpAddr) -> io::Result<IpAddr> {
    let socket = match remote {
        IpAddr::V4(_) => UdpSocket::bind("0.0.0.0:0")?,
        IpAddr::V6(_) => UdpSocket::bind("[::]:0")?,
    };
    socket.connect((*remote, 53))?;
    Ok(socket.local_addr()?.ip())
}
