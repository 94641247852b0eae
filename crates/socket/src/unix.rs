//! Unix ICMP sockets.
//!
//! macOS offers unprivileged datagram ICMP sockets; the other Unixes use
//! raw ICMP sockets, which normally require CAP_NET_RAW or root. Both are
//! opened non-blocking and all waiting happens in `poll`.

use crate::ProbeSocket;
use pingpath_core::{EngineError, EngineResult, IpVersion};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::error;

/// An ICMP socket for one IP version.
#[derive(Debug)]
pub struct IcmpSocket {
    fd: RawFd,
    version: IpVersion,
}

impl IcmpSocket {
    /// Opens a socket suitable for receiving all ICMP traffic of `version`.
    pub fn create_read_socket(version: IpVersion) -> EngineResult<Self> {
        let fd = open_socket(version).map_err(|err| creation_error(version, err))?;
        Ok(Self { fd, version })
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
        let (storage, len) = host_to_sockaddr(host)?;
        loop {
            let rc = unsafe {
                libc::sendto(
                    self.fd,
                    buffer.as_ptr() as *const libc::c_void,
                    buffer.len(),
                    0,
                    &storage as *const _ as *const libc::sockaddr,
                    len,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
    }

    fn recv_from(&self, buffer: &mut [u8], timeout: Duration) -> io::Result<(usize, IpAddr)> {
        let mut fds = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut fds as *mut _, 1, timeout.as_millis() as libc::c_int) };
        if rc == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "receive timeout"));
        }
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::recvfrom(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((rc as usize, sockaddr_to_host(&storage)?))
    }

    fn set_ttl(&self, ttl: u8) -> io::Result<()> {
        let value: libc::c_int = ttl.into();
        let (level, option) = match self.version {
            IpVersion::V4 => (libc::IPPROTO_IP, libc::IP_TTL),
            IpVersion::V6 => (libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS),
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                option,
                &value as *const _ as *const libc::c_void,
                mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn version(&self) -> IpVersion {
        self.version
    }
}

impl Drop for IcmpSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(target_os = "macos")]
fn open_socket(version: IpVersion) -> io::Result<RawFd> {
    let (domain, protocol) = socket_family(version);
    let fd = unsafe { libc::socket(domain, libc::SOCK_DGRAM, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    Ok(fd)
}

#[cfg(not(target_os = "macos"))]
fn open_socket(version: IpVersion) -> io::Result<RawFd> {
    let (domain, protocol) = socket_family(version);
    let fd = unsafe { libc::socket(domain, libc::SOCK_RAW | libc::SOCK_NONBLOCK, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn socket_family(version: IpVersion) -> (libc::c_int, libc::c_int) {
    match version {
        IpVersion::V4 => (libc::AF_INET, libc::IPPROTO_ICMP),
        IpVersion::V6 => (libc::AF_INET6, libc::IPPROTO_ICMPV6),
    }
}

fn creation_error(version: IpVersion, err: io::Error) -> EngineError {
    if matches!(err.raw_os_error(), Some(libc::EPERM) | Some(libc::EACCES)) {
        error!(
            %version,
            "raw ICMP sockets require elevated privileges; run as root or grant CAP_NET_RAW"
        );
        EngineError::PrivilegeRequired(err)
    } else {
        EngineError::SocketCreation {
            version,
            source: err,
        }
    }
}

fn host_to_sockaddr(host: &IpAddr) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match host {
        IpAddr::V4(addr) => {
            let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
            sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
            sockaddr.sin_addr = libc::in_addr {
                s_addr: u32::from_be_bytes(addr.octets()).to_be(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sockaddr as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            Ok((storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
        }
        IpAddr::V6(addr) => {
            let mut sockaddr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sockaddr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sockaddr.sin6_addr = libc::in6_addr {
                s6_addr: addr.octets(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &sockaddr as *const _ as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            Ok((storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
        }
    }
}

fn sockaddr_to_host(storage: &libc::sockaddr_storage) -> io::Result<IpAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sockaddr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(IpAddr::V4(Ipv4Addr::from(
                u32::from_be(sockaddr.sin_addr.s_addr).to_be_bytes(),
            )))
        }
        libc::AF_INET6 => {
            let sockaddr = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(IpAddr::V6(Ipv6Addr::from(sockaddr.sin6_addr.s6_addr)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}
