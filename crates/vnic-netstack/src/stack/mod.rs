//! The virtual network stack: one smoltcp interface fed by raw IP packets.
//!
//! A [`Netstack`] is a cheap handle to shared state. Packets from the
//! tunnel are handed in through [`Netstack::inject`]; packets produced by
//! the stack come out of the receiver returned by [`Netstack::new`]. A
//! driver task polls the interface whenever something changes and on
//! smoltcp's own timers.
//!
//! Endpoints (TCP streams and listeners, UDP sockets, ping sockets) hold a
//! socket handle into the shared [`SocketSet`]. A handle is removed from
//! the set only by its owner's `Drop`, so a live endpoint always refers to
//! a valid socket.

mod device;
mod tcp;
mod udp;

pub use tcp::{OwnedReadHalf, OwnedWriteHalf, TcpListener, TcpStream};
pub use udp::{UdpListener, UdpSession, UdpSocket};

use crate::addr::{convert_to_full_addr, FullAddress, NetworkProtocol};
use crate::context::Context;
use crate::dial::{Network, Transport};
use crate::error::{NetError, NetResult};
use device::QueueDevice;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp as smol_tcp, Socket};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr};
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use vnic_core::{InterfaceConfig, Packet, PacketPool};

/// Outbound packets buffered before the stack starts dropping them.
const OUTBOUND_QUEUE: usize = 1024;

/// Upper bound on driver sleeps when smoltcp has no timer pending.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// How long a dropped TCP connection may take to finish closing.
const TCP_LINGER: Duration = Duration::from_secs(30);

const EPHEMERAL_START: u16 = 49152;

pub(crate) const TCP_BUFFER: usize = 64 * 1024;

/// TCP and UDP ports are allocated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortSpace {
    Tcp,
    Udp,
}

/// State guarded by the stack lock.
pub(crate) struct State {
    pub(crate) iface: Interface,
    pub(crate) sockets: SocketSet<'static>,
    /// Queues between the driver and the packet channels.
    device: QueueDevice,
    /// Next ephemeral port to try.
    next_port: u16,
    /// Addresses and ports held by TCP listeners. smoltcp reports no local
    /// endpoint for a socket in LISTEN.
    pub(crate) tcp_listen_ports: HashSet<(Option<IpAddress>, u16)>,
    pub(crate) icmp_idents: HashSet<u16>,
    /// TCP sockets whose owner is gone, with the time they get aborted.
    orphans: Vec<(SocketHandle, Instant)>,
}

impl State {
    /// Pick an unused port from the dynamic range, wrapping around.
    pub(crate) fn ephemeral_port(&mut self, space: PortSpace) -> NetResult<u16> {
        let span = u32::from(u16::MAX - EPHEMERAL_START) + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_START
            } else {
                port + 1
            };
            if !self.port_in_use(space, None, port) {
                return Ok(port);
            }
        }
        Err(NetError::Stack {
            op: "bind",
            message: "no ephemeral ports available".into(),
        })
    }

    /// Whether binding `addr`:`port` would clash with an existing socket.
    /// A wildcard address clashes with every address.
    pub(crate) fn port_in_use(&self, space: PortSpace, addr: Option<IpAddress>, port: u16) -> bool {
        let overlaps = |other: Option<IpAddress>| match (addr, other) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        match space {
            PortSpace::Tcp => {
                self.tcp_listen_ports
                    .iter()
                    .any(|&(a, p)| p == port && overlaps(a))
                    || self.sockets.iter().any(|(_, socket)| match socket {
                        Socket::Tcp(s) => s
                            .local_endpoint()
                            .is_some_and(|ep| ep.port == port && overlaps(Some(ep.addr))),
                        _ => false,
                    })
            }
            PortSpace::Udp => self.sockets.iter().any(|(_, socket)| match socket {
                Socket::Udp(s) => {
                    let ep = s.endpoint();
                    ep.port == port && overlaps(ep.addr)
                }
                _ => false,
            }),
        }
    }

    /// Fail unless `addr` is one of the interface addresses.
    pub(crate) fn check_local(&self, op: &'static str, addr: Option<IpAddress>) -> NetResult<()> {
        match addr {
            Some(addr) if !self.iface.has_ip_addr(addr) => Err(NetError::Stack {
                op,
                message: format!("address {addr} not available"),
            }),
            _ => Ok(()),
        }
    }

    fn reap_orphans(&mut self, now: Instant) {
        let sockets = &mut self.sockets;
        self.orphans.retain(|&(handle, deadline)| {
            let socket = sockets.get_mut::<smol_tcp::Socket>(handle);
            match socket.state() {
                smol_tcp::State::Closed | smol_tcp::State::TimeWait => {
                    sockets.remove(handle);
                    false
                }
                _ => {
                    if now >= deadline {
                        socket.abort();
                    }
                    true
                }
            }
        });
    }
}

struct Shared {
    /// Interface and sockets. Never held across an await.
    state: Mutex<State>,
    /// Wakes the driver for an immediate poll.
    notify: Notify,
    shutdown: CancellationToken,
    closed: AtomicBool,
    /// Outbound packets are taken from here and inbound ones returned.
    pool: Arc<PacketPool>,
    /// Whether the interface has an IPv4 (`v4`) or IPv6 (`v6`) address.
    v4: bool,
    v6: bool,
}

/// Handle to a running virtual stack.
#[derive(Clone)]
pub struct Netstack {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Netstack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netstack")
            .field("v4", &self.shared.v4)
            .field("v6", &self.shared.v6)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Netstack {
    /// Build a stack with the interface addresses in `config` and start
    /// its driver task on the current Tokio runtime.
    ///
    /// Returns the stack handle and the receiver of packets the stack
    /// emits. Dropping the receiver discards outbound traffic.
    ///
    /// # Errors
    ///
    /// Fails if an address does not parse or the interface cannot hold all
    /// of them.
    pub fn new(
        config: &InterfaceConfig,
        pool: Arc<PacketPool>,
    ) -> NetResult<(Self, mpsc::Receiver<Packet>)> {
        let cidrs = config.cidrs().map_err(|e| NetError::Stack {
            op: "interface",
            message: e.to_string(),
        })?;

        let mut device = QueueDevice::new(Arc::clone(&pool), config.mtu);
        let mut iface_config = Config::new(HardwareAddress::Ip);
        iface_config.random_seed = rand::random();
        let mut iface = Interface::new(iface_config, &mut device, smoltcp::time::Instant::now());

        let mut overflow = false;
        iface.update_ip_addrs(|addrs| {
            for &(ip, prefix) in &cidrs {
                if addrs.push(IpCidr::new(IpAddress::from(ip), prefix)).is_err() {
                    overflow = true;
                }
            }
        });
        if overflow {
            return Err(NetError::Stack {
                op: "interface",
                message: "too many interface addresses".into(),
            });
        }

        let v4 = cidrs.iter().find_map(|(ip, _)| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        });
        let v6 = cidrs.iter().find_map(|(ip, _)| match ip {
            IpAddr::V6(v6) => Some(*v6),
            IpAddr::V4(_) => None,
        });
        // Every destination goes out the one interface.
        if let Some(gw) = v4 {
            iface
                .routes_mut()
                .add_default_ipv4_route(gw)
                .map_err(|e| NetError::stack("route", e))?;
        }
        if let Some(gw) = v6 {
            iface
                .routes_mut()
                .add_default_ipv6_route(gw)
                .map_err(|e| NetError::stack("route", e))?;
        }

        let state = State {
            iface,
            sockets: SocketSet::new(Vec::new()),
            device,
            next_port: rand::thread_rng().gen_range(EPHEMERAL_START..=u16::MAX),
            tcp_listen_ports: HashSet::new(),
            icmp_idents: HashSet::new(),
            orphans: Vec::new(),
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            pool,
            v4: v4.is_some(),
            v6: v6.is_some(),
        });

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(drive(Arc::clone(&shared), tx));

        info!(
            addresses = ?config.addresses,
            mtu = config.mtu,
            "network stack started"
        );
        Ok((Self { shared }, rx))
    }

    /// Queue a raw IP packet for the stack.
    pub fn inject(&self, packet: Packet) -> NetResult<()> {
        if self.is_closed() {
            self.shared.pool.put(packet);
            return Err(NetError::Closed);
        }
        self.shared.state.lock().device.rx.push_back(packet);
        self.kick();
        Ok(())
    }

    /// Whether the interface carries an IPv4 address.
    pub fn has_v4(&self) -> bool {
        self.shared.v4
    }

    /// Whether the interface carries an IPv6 address.
    pub fn has_v6(&self) -> bool {
        self.shared.v6
    }

    /// Pool that outbound packets are drawn from and injected ones return to.
    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.shared.pool
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Tear the stack down.
    ///
    /// TCP connections are aborted and UDP sockets unbound, which wakes
    /// every blocked reader, writer and acceptor; they and every later
    /// operation fail with [`NetError::Closed`]. Calling this more than
    /// once has no further effect.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            for (_, socket) in state.sockets.iter_mut() {
                match socket {
                    Socket::Tcp(s) => s.abort(),
                    Socket::Udp(s) => s.close(),
                    _ => {}
                }
            }
            let pending: Vec<Packet> = state.device.rx.drain(..).collect();
            for packet in pending {
                self.shared.pool.put(packet);
            }
        }
        self.shared.shutdown.cancel();
        info!("network stack closed");
    }

    /// Resolve once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    // ── Endpoint constructors ───────────────────────────────────────

    /// Connect a TCP stream to `addr`, bounded by `ctx`.
    ///
    /// # Errors
    ///
    /// [`NetError::Refused`] if the peer resets the handshake,
    /// [`NetError::Timeout`] or [`NetError::Canceled`] from `ctx`.
    pub async fn dial_tcp(&self, ctx: &Context, addr: SocketAddr) -> NetResult<TcpStream> {
        let stream = TcpStream::connect(self, addr)?;
        ctx.run(self.until_closed(stream.wait_established())).await?;
        debug!(addr = %addr, local = %stream.local_addr(), "tcp connected");
        Ok(stream)
    }

    /// Listen for TCP connections on `addr`. An unspecified IP accepts
    /// connections to any interface address; port 0 picks an ephemeral port.
    pub fn listen_tcp(&self, addr: SocketAddr) -> NetResult<TcpListener> {
        let (local, protocol) = convert_to_full_addr(addr);
        TcpListener::bind(self, local, protocol)
    }

    /// Open a UDP socket bound to `laddr` (any address, ephemeral port when
    /// absent) and, when `raddr` is given, connected to it.
    pub fn dial_udp(
        &self,
        laddr: Option<SocketAddr>,
        raddr: Option<SocketAddr>,
    ) -> NetResult<UdpSocket> {
        if laddr.is_none() && raddr.is_none() {
            return Err(NetError::MissingAddress);
        }
        UdpSocket::bind(self, laddr, raddr)
    }

    /// Bind an unconnected UDP socket on `laddr`. An unspecified address
    /// receives on every interface address.
    pub fn listen_udp(&self, laddr: SocketAddr) -> NetResult<UdpSocket> {
        UdpSocket::bind(self, Some(laddr), None)
    }

    /// Open a listener of kind `scheme` (`tcp`, `udp`, optionally suffixed
    /// with `4` or `6`) on `port` of every interface address.
    pub fn listen(&self, scheme: &str, port: u16) -> NetResult<Listener> {
        let network: Network = scheme.parse()?;
        let protocol = match network.family {
            Some(NetworkProtocol::Ipv6) => NetworkProtocol::Ipv6,
            _ => NetworkProtocol::Ipv4,
        };
        match network.transport {
            Transport::Tcp => {
                TcpListener::bind(self, FullAddress::any(port), protocol).map(Listener::Tcp)
            }
            Transport::Udp => {
                let addr = SocketAddr::new(protocol.unspecified(), port);
                UdpListener::bind(self, addr).map(Listener::Udp)
            }
            Transport::Ping => Err(NetError::UnknownNetwork(scheme.to_string())),
        }
    }

    // ── Crate internals ─────────────────────────────────────────────

    /// Lock the stack, failing once it is closed.
    pub(crate) fn lock(&self) -> NetResult<MutexGuard<'_, State>> {
        let state = self.shared.state.lock();
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        Ok(state)
    }

    /// Lock the stack regardless of shutdown, for releasing sockets.
    pub(crate) fn lock_any(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock()
    }

    /// Ask the driver for an immediate poll.
    pub(crate) fn kick(&self) {
        self.shared.notify.notify_one();
    }

    /// Run `fut`, failing with [`NetError::Closed`] if the stack shuts down
    /// first.
    pub(crate) async fn until_closed<T, F>(&self, fut: F) -> NetResult<T>
    where
        F: Future<Output = NetResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => Err(NetError::Closed),
            res = fut => res,
        }
    }

    /// Hand a TCP socket whose owner is gone to the driver: it is closed
    /// gracefully and removed once the close completes or lingers too long.
    pub(crate) fn release_tcp(&self, handle: SocketHandle) {
        let mut state = self.lock_any();
        if self.is_closed() {
            state.sockets.remove(handle);
            return;
        }
        state.sockets.get_mut::<smol_tcp::Socket>(handle).close();
        state.orphans.push((handle, Instant::now() + TCP_LINGER));
        drop(state);
        self.kick();
    }
}

/// A listener opened by [`Netstack::listen`].
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpListener),
}

/// A connection accepted from a [`Listener`].
pub enum Inbound {
    Tcp(TcpStream),
    Udp(UdpSession),
}

impl Listener {
    /// Wait for the next connection, or the next UDP peer.
    pub async fn accept(&self) -> NetResult<(Inbound, SocketAddr)> {
        match self {
            Self::Tcp(l) => l.accept().await.map(|(s, peer)| (Inbound::Tcp(s), peer)),
            Self::Udp(l) => l.accept().await.map(|(s, peer)| (Inbound::Udp(s), peer)),
        }
    }

    /// Stop accepting. Pending `accept` calls fail with
    /// [`NetError::Closed`].
    pub fn close(&self) {
        match self {
            Self::Tcp(l) => l.close(),
            Self::Udp(l) => l.close(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(l) => l.local_addr(),
            Self::Udp(l) => l.local_addr(),
        }
    }
}

impl Inbound {
    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp(s) => s.peer_addr(),
            Self::Udp(s) => s.peer_addr(),
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

async fn drive(shared: Arc<Shared>, tx: mpsc::Sender<Packet>) {
    loop {
        let (outbound, delay, backlog) = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            let now = smoltcp::time::Instant::now();
            let _ = state.iface.poll(now, &mut state.device, &mut state.sockets);
            state.reap_orphans(Instant::now());
            let outbound: Vec<Packet> = state.device.tx.drain(..).collect();
            let delay = state
                .iface
                .poll_delay(now, &state.sockets)
                .map(|d| Duration::from_micros(d.total_micros()));
            (outbound, delay, !state.device.rx.is_empty())
        };

        for packet in outbound {
            match tx.try_send(packet) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(packet)) => {
                    trace!(len = packet.len(), "outbound queue full, dropping packet");
                    shared.pool.put(packet);
                }
                Err(mpsc::error::TrySendError::Closed(packet)) => {
                    shared.pool.put(packet);
                }
            }
        }

        if backlog {
            tokio::task::yield_now().await;
            continue;
        }

        let sleep = delay.map_or(IDLE_POLL, |d| d.min(IDLE_POLL));
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.notify.notified() => {}
            _ = tokio::time::sleep(sleep) => {}
        }
    }

    debug!("network stack driver stopped");
}
