//! Conversion between portable socket addresses and the stack's native
//! endpoint form.

use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Identifier of a network interface inside the stack.
pub type NicId = u32;

/// The stack owns exactly one interface.
pub const NIC_ID: NicId = 1;

/// Network-layer protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// EtherType number.
    pub fn number(self) -> u16 {
        match self {
            Self::Ipv4 => 0x0800,
            Self::Ipv6 => 0x86dd,
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Interface, address and port of an endpoint. `addr` is `None` for the
/// wildcard ("any") address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullAddress {
    pub nic: NicId,
    pub addr: Option<IpAddress>,
    pub port: u16,
}

impl FullAddress {
    pub fn any(port: u16) -> Self {
        Self {
            nic: NIC_ID,
            addr: None,
            port,
        }
    }

    /// A concrete endpoint, or `None` for the wildcard address.
    pub fn endpoint(&self) -> Option<IpEndpoint> {
        self.addr.map(|addr| IpEndpoint::new(addr, self.port))
    }

    pub fn listen_endpoint(&self) -> IpListenEndpoint {
        IpListenEndpoint {
            addr: self.addr,
            port: self.port,
        }
    }

    /// Back to portable form; the wildcard maps to the unspecified address
    /// of `protocol`.
    pub fn to_socket_addr(&self, protocol: NetworkProtocol) -> SocketAddr {
        let ip = self
            .addr
            .map(IpAddr::from)
            .unwrap_or_else(|| protocol.unspecified());
        SocketAddr::new(ip, self.port)
    }
}

/// Convert a portable address into the stack's form plus its protocol.
///
/// An unspecified IP keeps its family but becomes the wildcard address.
pub fn convert_to_full_addr(addr: SocketAddr) -> (FullAddress, NetworkProtocol) {
    let protocol = NetworkProtocol::of(addr.ip());
    let ip = (!addr.ip().is_unspecified()).then(|| IpAddress::from(addr.ip()));
    (
        FullAddress {
            nic: NIC_ID,
            addr: ip,
            port: addr.port(),
        },
        protocol,
    )
}

/// Like [`convert_to_full_addr`], but a missing address becomes the
/// wildcard with the caller's `fallback` protocol.
pub fn full_addr(addr: Option<SocketAddr>, fallback: NetworkProtocol) -> (FullAddress, NetworkProtocol) {
    match addr {
        Some(addr) => convert_to_full_addr(addr),
        None => (FullAddress::any(0), fallback),
    }
}

pub(crate) fn endpoint_to_socket_addr(ep: IpEndpoint) -> SocketAddr {
    SocketAddr::new(IpAddr::from(ep.addr), ep.port)
}
