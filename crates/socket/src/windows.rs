//! Windows ICMP sockets.
//!
//! Raw ICMP sockets bound to the unspecified address, switched to
//! non-blocking with FIONBIO and waited on with WSAPoll. Winsock is
//! initialised once per process.

use crate::ProbeSocket;
use pingpath_core::{EngineError, EngineResult, IpVersion};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Once;
use std::time::Duration;
use tracing::error;
use windows_sys::Win32::Networking::WinSock::{
    bind, closesocket, ioctlsocket, recvfrom, sendto, setsockopt, socket, WSAGetLastError,
    WSAPoll, WSAStartup, AF_INET, AF_INET6, FIONBIO, INVALID_SOCKET, IPPROTO_ICMP,
    IPPROTO_ICMPV6, IPPROTO_IP, IPPROTO_IPV6, IPV6_UNICAST_HOPS, IP_TTL, SOCKADDR,
    SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOCK_RAW, WSADATA,
    WSAPOLLFD,
};

const POLL_READ: i16 = 0x0100 | 0x0200; // POLLRDNORM | POLLRDBAND

fn startup_winsock() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let mut data: WSADATA = unsafe { mem::zeroed() };
        let rc = unsafe { WSAStartup(0x0202, &mut data) };
        if rc != 0 {
            error!(code = rc, "WSAStartup failed");
        }
    });
}

fn last_socket_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

/// An ICMP socket for one IP version.
#[derive(Debug)]
pub struct IcmpSocket {
    handle: SOCKET,
    version: IpVersion,
}

// SOCKET is an opaque kernel handle; the Winsock calls used here are
// thread-safe per handle.
unsafe impl Send for IcmpSocket {}
unsafe impl Sync for IcmpSocket {}

impl IcmpSocket {
    /// Opens a raw ICMP socket bound to the unspecified address, suitable
    /// for receiving all ICMP traffic of `version`.
    pub fn create_read_socket(version: IpVersion) -> EngineResult<Self> {
        startup_winsock();

        let (family, protocol) = match version {
            IpVersion::V4 => (AF_INET, IPPROTO_ICMP),
            IpVersion::V6 => (AF_INET6, IPPROTO_ICMPV6),
        };
        let handle = unsafe { socket(i32::from(family), SOCK_RAW as i32, protocol) };
        if handle == INVALID_SOCKET {
            let err = last_socket_error();
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!(%version, "raw ICMP sockets require administrator rights");
                return Err(EngineError::PrivilegeRequired(err));
            }
            return Err(EngineError::SocketCreation {
                version,
                source: err,
            });
        }

        let socket = Self { handle, version };

        let mut non_blocking: u32 = 1;
        let rc = unsafe { ioctlsocket(handle, FIONBIO, &mut non_blocking) };
        if rc == SOCKET_ERROR {
            return Err(EngineError::SocketOption {
                option: "FIONBIO",
                source: last_socket_error(),
            });
        }

        let unspecified = version.unspecified();
        let (storage, len) = host_to_sockaddr(&unspecified);
        let rc = unsafe { bind(handle, &storage as *const _ as *const SOCKADDR, len) };
        if rc == SOCKET_ERROR {
            return Err(EngineError::SocketBind {
                addr: unspecified,
                source: last_socket_error(),
            });
        }

        Ok(socket)
    }

    /// Opens a socket for sending probes. A non-zero `ttl` is applied as
    /// IP_TTL or IPV6_UNICAST_HOPS; zero keeps the system default.
    pub fn create_write_socket(ttl: u8, version: IpVersion) -> EngineResult<Self> {
        let socket = Self::create_read_socket(version)?;
        if ttl != 0 {
            socket.set_ttl(ttl).map_err(|err| EngineError::SocketOption {
                option: match version {
                    IpVersion::V4 => "IP_TTL",
                    IpVersion::V6 => "IPV6_UNICAST_HOPS",
                },
                source: err,
            })?;
        }
        Ok(socket)
    }
}

impl ProbeSocket for IcmpSocket {
    fn send_to(&self, buffer: &[u8], host: &IpAddr) -> io::Result<usize> {
        let (storage, len) = host_to_sockaddr(host);
        loop {
            let rc = unsafe {
                sendto(
                    self.handle,
                    buffer.as_ptr(),
                    buffer.len() as i32,
                    0,
                    &storage as *const _ as *const SOCKADDR,
                    len,
                )
            };
            if rc != SOCKET_ERROR {
                return Ok(rc as usize);
            }
            let err = last_socket_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
    }

    fn recv_from(&self, buffer: &mut [u8], timeout: Duration) -> io::Result<(usize, IpAddr)> {
        let mut fds = WSAPOLLFD {
            fd: self.handle,
            events: POLL_READ,
            revents: 0,
        };
        let rc = unsafe { WSAPoll(&mut fds, 1, timeout.as_millis() as i32) };
        if rc == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "receive timeout"));
        }
        if rc == SOCKET_ERROR {
            return Err(last_socket_error());
        }

        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
        let rc = unsafe {
            recvfrom(
                self.handle,
                buffer.as_mut_ptr(),
                buffer.len() as i32,
                0,
                &mut storage as *mut _ as *mut SOCKADDR,
                &mut addr_len,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(last_socket_error());
        }
        Ok((rc as usize, sockaddr_to_host(&storage)?))
    }

    fn set_ttl(&self, ttl: u8) -> io::Result<()> {
        let value: i32 = ttl.into();
        let (level, option) = match self.version {
            IpVersion::V4 => (IPPROTO_IP, IP_TTL),
            IpVersion::V6 => (IPPROTO_IPV6, IPV6_UNICAST_HOPS),
        };
        let rc = unsafe {
            setsockopt(
                self.handle,
                level,
                option as i32,
                &value as *const _ as *const u8,
                mem::size_of_val(&value) as i32,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(last_socket_error());
        }
        Ok(())
    }

    fn version(&self) -> IpVersion {
        self.version
    }
}

impl Drop for IcmpSocket {
    fn drop(&mut self) {
        if self.handle != INVALID_SOCKET {
            unsafe {
                closesocket(self.handle);
            }
            self.handle = INVALID_SOCKET;
        }
    }
}

fn host_to_sockaddr(host: &IpAddr) -> (SOCKADDR_STORAGE, i32) {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    match host {
        IpAddr::V4(addr) => {
            let mut sockaddr: SOCKADDR_IN = unsafe { mem::zeroed() };
            sockaddr.sin_family = AF_INET;
            sockaddr.sin_addr.S_un.S_addr = u32::from_be_bytes(addr.octets()).to_be();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sockaddr as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<SOCKADDR_IN>(),
                );
            }
            (storage, mem::size_of::<SOCKADDR_IN>() as i32)
        }
        IpAddr::V6(addr) => {
            let mut sockaddr: SOCKADDR_IN6 = unsafe { mem::zeroed() };
            sockaddr.sin6_family = AF_INET6;
            sockaddr.sin6_addr.u.Byte = addr.octets();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sockaddr as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<SOCKADDR_IN6>(),
                );
            }
            (storage, mem::size_of::<SOCKADDR_IN6>() as i32)
        }
    }
}

fn sockaddr_to_host(storage: &SOCKADDR_STORAGE) -> io::Result<IpAddr> {
    match storage.ss_family {
        AF_INET => {
            let sockaddr = unsafe { &*(storage as *const _ as *const SOCKADDR_IN) };
            let raw = unsafe { sockaddr.sin_addr.S_un.S_addr };
            Ok(IpAddr::V4(Ipv4Addr::from(u32::from_be(raw).to_be_bytes())))
        }
        AF_INET6 => {
            let sockaddr = unsafe { &*(storage as *const _ as *const SOCKADDR_IN6) };
            let octets = unsafe { sockaddr.sin6_addr.u.Byte };
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}
