//! Shared value types.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IP version of an engine, socket, or packet.
///
/// Determines the socket family, the packet layout, and the address
/// encoding used throughout the measurement path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// The version of a concrete address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Whether `addr` belongs to this version.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }

    /// The unspecified address of this version, used as the sentinel for
    /// unresponsive hops and unknown reply sources.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl std::fmt::Display for IpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "ipv4"),
            IpVersion::V6 => write!(f, "ipv6"),
        }
    }
}

/// Ordered list of hop addresses for a discovered route.
///
/// Unresponsive hops are `None` so that `index + 1` is always the TTL at
/// which the hop was probed.
pub type RouteList = Vec<Option<IpAddr>>;
