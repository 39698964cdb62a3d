//! Name-based dialing over the virtual stack.
//!
//! [`Dialer::dial`] takes a network (`tcp`, `udp` or `ping`, optionally
//! suffixed with `4` or `6`) and an address, resolves the host, and tries
//! the resulting addresses one after another until one connects. When the
//! context has a deadline, each attempt gets an even share of the time
//! left, but never less than two seconds unless less than that remains.

use crate::addr::NetworkProtocol;
use crate::context::Context;
use crate::dns::Resolver;
use crate::error::{NetError, NetResult};
use crate::ping::PingConn;
use crate::stack::{Netstack, TcpStream, UdpSocket};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use vnic_core::DnsConfig;

/// Lower bound on the time given to one dial attempt.
const SANE_MINIMUM: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
    Ping,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Ping => "ping",
        }
    }
}

/// A parsed network name. `family` is `None` when both IP versions are
/// acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Network {
    pub transport: Transport,
    pub family: Option<NetworkProtocol>,
}

impl Network {
    pub fn accepts(&self, ip: IpAddr) -> bool {
        self.family.map_or(true, |family| family == NetworkProtocol::of(ip))
    }
}

impl FromStr for Network {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || NetError::UnknownNetwork(s.to_string());
        let (base, family) = match s.as_bytes().last() {
            Some(b'4') => (&s[..s.len() - 1], Some(NetworkProtocol::Ipv4)),
            Some(b'6') => (&s[..s.len() - 1], Some(NetworkProtocol::Ipv6)),
            _ => (s, None),
        };
        let transport = match base {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            "ping" => Transport::Ping,
            _ => return Err(unknown()),
        };
        Ok(Self { transport, family })
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.transport.as_str())?;
        match self.family {
            Some(NetworkProtocol::Ipv4) => f.write_str("4"),
            Some(NetworkProtocol::Ipv6) => f.write_str("6"),
            None => Ok(()),
        }
    }
}

/// Split `host:port` or `[host]:port`.
pub fn split_host_port(address: &str) -> NetResult<(&str, &str)> {
    let invalid = |reason| NetError::InvalidAddress(address.to_string(), reason);

    if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| invalid("missing ']' in address"))?;
        let host = &rest[..end];
        return match rest[end + 1..].strip_prefix(':') {
            Some(port) if !port.contains(':') => Ok((host, port)),
            Some(_) => Err(invalid("too many colons in address")),
            None if rest.len() == end + 1 => Err(invalid("missing port in address")),
            None => Err(invalid("unexpected characters after ']'")),
        };
    }

    let colon = address.rfind(':').ok_or_else(|| invalid("missing port in address"))?;
    let host = &address[..colon];
    if host.contains(':') {
        return Err(invalid("too many colons in address"));
    }
    if host.contains('[') || host.contains(']') {
        return Err(invalid("unexpected bracket in address"));
    }
    Ok((host, &address[colon + 1..]))
}

/// Deadline for the next of `addrs_remaining` attempts sharing the time
/// between `now` and `deadline`.
///
/// # Errors
///
/// [`NetError::Timeout`] if `deadline` has already passed.
pub fn partial_deadline(now: Instant, deadline: Instant, addrs_remaining: usize) -> NetResult<Instant> {
    let remaining = deadline.saturating_duration_since(now);
    if remaining.is_zero() {
        return Err(NetError::Timeout);
    }
    let share = u32::try_from(addrs_remaining.max(1)).unwrap_or(u32::MAX);
    let timeout = (remaining / share).max(remaining.min(SANE_MINIMUM));
    Ok(now + timeout)
}

/// A connection returned by [`Dialer::dial`].
#[derive(Debug)]
pub enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Ping(PingConn),
}

impl Conn {
    pub fn transport(&self) -> Transport {
        match self {
            Self::Tcp(_) => Transport::Tcp,
            Self::Udp(_) => Transport::Udp,
            Self::Ping(_) => Transport::Ping,
        }
    }

    /// IP of the remote end.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        match self {
            Self::Tcp(s) => Some(s.peer_addr().ip()),
            Self::Udp(s) => s.peer_addr().map(|a| a.ip()),
            Self::Ping(p) => p.remote_addr().ip(),
        }
    }

    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            Self::Tcp(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_udp(self) -> Option<UdpSocket> {
        match self {
            Self::Udp(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_ping(self) -> Option<PingConn> {
        match self {
            Self::Ping(p) => Some(p),
            _ => None,
        }
    }
}

/// Dials names and addresses through a [`Netstack`], resolving names with
/// a [`Resolver`] on the same stack.
#[derive(Debug, Clone)]
pub struct Dialer {
    stack: Netstack,
    resolver: Resolver,
}

impl Dialer {
    pub fn new(stack: Netstack, resolver: Resolver) -> Self {
        Self { stack, resolver }
    }

    pub fn from_config(stack: Netstack, dns: &DnsConfig) -> Self {
        let resolver = Resolver::from_config(stack.clone(), dns);
        Self::new(stack, resolver)
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Connect to `address` on `network`.
    ///
    /// For `tcp` and `udp` the address is `host:port`; for `ping` it is a
    /// bare host. Resolved addresses of the wrong family are dropped and
    /// the rest are tried in resolver order.
    ///
    /// # Errors
    ///
    /// Every error is wrapped in [`NetError::Op`]. The cause is
    /// [`NetError::UnknownNetwork`], [`NetError::InvalidAddress`] or
    /// [`NetError::NumericPort`] for malformed input, the resolver's error,
    /// [`NetError::NoSuitableAddress`] if resolution found only excluded
    /// families, [`NetError::Canceled`] or [`NetError::Timeout`] from `ctx`,
    /// or else the first failed attempt.
    pub async fn dial(&self, ctx: &Context, network: &str, address: &str) -> NetResult<Conn> {
        let wrap = |e| NetError::op("dial", network, e);
        let net: Network = network.parse().map_err(wrap)?;

        let (host, port) = match net.transport {
            Transport::Ping => (address, 0),
            Transport::Tcp | Transport::Udp => {
                let (host, port) = split_host_port(address).map_err(wrap)?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| wrap(NetError::NumericPort(address.to_string())))?;
                (host, port)
            }
        };

        let resolved = self.resolver.lookup_ip(ctx, host).await.map_err(wrap)?;
        let candidates: Vec<SocketAddr> = resolved
            .iter()
            .copied()
            .filter(|&ip| net.accepts(ip))
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if candidates.is_empty() && !resolved.is_empty() {
            return Err(wrap(NetError::NoSuitableAddress));
        }

        let mut first_err = None;
        for (i, &addr) in candidates.iter().enumerate() {
            if let Some(err) = ctx.err() {
                return Err(wrap(err));
            }

            let mut attempt_ctx = ctx.clone();
            if let Some(deadline) = ctx.deadline() {
                match partial_deadline(Instant::now(), deadline, candidates.len() - i) {
                    Ok(partial) if partial < deadline => attempt_ctx = ctx.with_deadline(partial),
                    Ok(_) => {}
                    Err(e) => {
                        first_err.get_or_insert_with(|| wrap(e));
                        break;
                    }
                }
            }

            let attempt = match net.transport {
                Transport::Tcp => self.stack.dial_tcp(&attempt_ctx, addr).await.map(Conn::Tcp),
                Transport::Udp => self.stack.dial_udp(None, Some(addr)).map(Conn::Udp),
                Transport::Ping => self.stack.dial_ping(None, Some(addr.ip())).map(Conn::Ping),
            };
            match attempt {
                Ok(conn) => {
                    info!(network = %net, addr = %addr, "dialed");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(network = %net, addr = %addr, error = %e, "dial attempt failed");
                    first_err.get_or_insert_with(|| NetError::op("dial", format!("{net} {addr}"), e));
                }
            }
        }

        Err(first_err.unwrap_or_else(|| wrap(NetError::MissingAddress)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DnsServer, Pair};
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dialer(pair: &Pair, servers: Vec<IpAddr>) -> Dialer {
        Dialer::new(pair.a.clone(), Resolver::new(pair.a.clone(), servers))
    }

    #[test]
    fn parses_networks() {
        let tcp: Network = "tcp".parse().unwrap();
        assert_eq!(tcp.transport, Transport::Tcp);
        assert_eq!(tcp.family, None);
        let udp6: Network = "udp6".parse().unwrap();
        assert_eq!(udp6.family, Some(NetworkProtocol::Ipv6));
        assert_eq!(udp6.to_string(), "udp6");
        let ping4: Network = "ping4".parse().unwrap();
        assert_eq!(ping4.transport, Transport::Ping);
        assert!(ping4.accepts("10.0.0.1".parse().unwrap()));
        assert!(!ping4.accepts("fd00::1".parse().unwrap()));

        for bad in ["", "4", "tcp46", "tcp5", "TCP", "ip", "sctp", "udp 4"] {
            assert!(
                matches!(bad.parse::<Network>(), Err(NetError::UnknownNetwork(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("example.com:80").unwrap(), ("example.com", "80"));
        assert_eq!(split_host_port("[fd00::1]:53").unwrap(), ("fd00::1", "53"));
        assert_eq!(split_host_port(":8080").unwrap(), ("", "8080"));
        assert_eq!(split_host_port("host:").unwrap(), ("host", ""));
        for bad in ["example.com", "fd00::1:53", "[fd00::1]", "[fd00::1]x:53", "[fd00::1:53"] {
            assert!(
                matches!(split_host_port(bad), Err(NetError::InvalidAddress(..))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn partial_deadline_shares_remaining_time() {
        let now = Instant::now();
        let deadline = now + Duration::from_secs(10);
        assert_eq!(partial_deadline(now, deadline, 5).unwrap(), now + SANE_MINIMUM);
        assert_eq!(partial_deadline(now, deadline, 2).unwrap(), now + Duration::from_secs(5));
        assert_eq!(partial_deadline(now, deadline, 1).unwrap(), deadline);
        // Shares below the minimum are raised to it.
        assert_eq!(partial_deadline(now, deadline, 20).unwrap(), now + SANE_MINIMUM);
        // Less than the minimum left: all of it goes to this attempt.
        let short = now + Duration::from_secs(1);
        assert_eq!(partial_deadline(now, short, 3).unwrap(), short);

        let past = partial_deadline(deadline, now, 1).unwrap_err();
        assert!(matches!(past, NetError::Timeout));
        assert!(partial_deadline(now, now, 1).is_err());
    }

    #[tokio::test]
    async fn rejects_malformed_targets() {
        let pair = Pair::new();
        let d = dialer(&pair, Vec::new());
        let ctx = Context::background();

        let err = d.dial(&ctx, "tcp", "10.0.0.1:http").await.unwrap_err();
        assert!(err.to_string().ends_with("port must be numeric"), "{err}");
        let err = d.dial(&ctx, "udp", "10.0.0.1:70000").await.unwrap_err();
        assert!(err.to_string().ends_with("port must be numeric"), "{err}");
        let err = d.dial(&ctx, "tcp", "10.0.0.1").await.unwrap_err();
        assert!(err.to_string().contains("missing port"), "{err}");
        let err = d.dial(&ctx, "quic", "10.0.0.1:1").await.unwrap_err();
        assert_eq!(err.to_string(), "dial quic: unknown network quic");
    }

    #[tokio::test]
    async fn excluded_family_is_not_suitable() {
        let pair = Pair::new();
        let d = dialer(&pair, Vec::new());
        let err = d
            .dial(&Context::background(), "tcp6", "10.0.0.1:80")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NetError::Op { ref source, .. } if matches!(**source, NetError::NoSuitableAddress)
        ));
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_such() {
        let pair = Pair::new();
        let d = dialer(&pair, Vec::new());
        let ctx = Context::background().with_cancel();
        ctx.cancel();
        let err = d.dial(&ctx, "tcp", "10.0.0.1:80").await.unwrap_err();
        assert!(err.is_canceled());
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn dials_literal_tcp_udp_and_ping() {
        let pair = Pair::new();
        let listener = pair.b.listen_tcp("10.0.0.1:8080".parse().unwrap()).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let d = dialer(&pair, Vec::new());
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let conn = d.dial(&ctx, "tcp4", "10.0.0.1:8080").await.unwrap();
        assert_eq!(conn.transport(), Transport::Tcp);
        let mut stream = conn.into_tcp().unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hi");

        let conn = d.dial(&ctx, "udp", "[fd00::1]:5000").await.unwrap();
        assert_eq!(conn.remote_ip(), Some("fd00::1".parse().unwrap()));

        let conn = d.dial(&ctx, "ping", "10.0.0.1").await.unwrap();
        assert_eq!(conn.transport(), Transport::Ping);
        assert_eq!(conn.remote_ip(), Some("10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn falls_through_to_next_candidate() {
        let pair = Pair::new();
        // 10.0.0.3 refuses; 10.0.0.1 accepts.
        let server = DnsServer::start(&pair.b)
            .a("web.example.", Ipv4Addr::new(10, 0, 0, 3))
            .a("web.example.", Ipv4Addr::new(10, 0, 0, 1));
        let listener = pair.b.listen_tcp("10.0.0.1:8081".parse().unwrap()).unwrap();
        tokio::spawn(async move {
            let _conn = listener.accept().await;
            std::future::pending::<()>().await;
        });

        let d = dialer(&pair, vec![server.addr().ip()]);
        let ctx = Context::background().with_timeout(Duration::from_secs(10));
        let conn = d.dial(&ctx, "tcp", "web.example:8081").await.unwrap();
        assert_eq!(conn.remote_ip(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[tokio::test]
    async fn reports_first_failure() {
        let pair = Pair::new();
        let server = DnsServer::start(&pair.b)
            .a("down.example.", Ipv4Addr::new(10, 0, 0, 3))
            .a("down.example.", Ipv4Addr::new(10, 0, 0, 1));
        let d = dialer(&pair, vec![server.addr().ip()]);
        let ctx = Context::background().with_timeout(Duration::from_secs(10));
        let err = d.dial(&ctx, "tcp", "down.example:9").await.unwrap_err();
        assert_eq!(err.to_string(), "dial tcp 10.0.0.3:9: connection refused");
    }

    #[tokio::test]
    async fn unknown_host_propagates_resolver_error() {
        let pair = Pair::new();
        let server = DnsServer::start(&pair.b);
        let d = dialer(&pair, vec![server.addr().ip()]);
        let err = d
            .dial(&Context::background(), "tcp", "nowhere.example:80")
            .await
            .unwrap_err();
        assert!(err.as_dns().is_some_and(|e| e.is_not_found()), "{err}");
    }
}
