//! vnic-netstack: the user-space network core of a vnic endpoint.
//!
//! Runs a smoltcp interface over raw IP packets and builds the endpoint's
//! services on it: address translation, a stub DNS resolver, dialing by
//! name, unprivileged ping sockets, and port forwarding from the virtual
//! network to the host.

pub mod addr;
pub mod context;
pub mod dial;
pub mod dns;
pub mod error;
pub mod forward;
pub mod ping;
pub mod stack;

#[cfg(test)]
mod testing;

// Re-export commonly used items at crate root.
pub use addr::{convert_to_full_addr, FullAddress, NetworkProtocol};
pub use context::Context;
pub use dial::{Conn, Dialer, Network, Transport};
pub use dns::{Resolver, ResolverConfig};
pub use error::{DnsError, DnsErrorKind, NetError, NetResult};
pub use forward::{ForwardHandle, Forwarder};
pub use ping::{PingAddr, PingConn};
pub use stack::{Inbound, Listener, Netstack, TcpListener, TcpStream, UdpListener, UdpSession, UdpSocket};
