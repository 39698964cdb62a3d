//! Test harness: two stacks wired back to back, and a scripted DNS server
//! living on one of them.

use crate::dns::message::{Header, MessageBuilder, Parser, Question, RCode, TYPE_A, TYPE_AAAA};
use crate::stack::Netstack;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use vnic_core::{InterfaceConfig, Packet, PacketPool};

/// Two stacks whose outbound packets are injected into each other.
///
/// `a` is 10.0.0.2 and fd00::2. `b` is 10.0.0.1, 10.0.0.3 and fd00::1.
pub(crate) struct Pair {
    pub(crate) a: Netstack,
    pub(crate) b: Netstack,
}

impl Pair {
    pub(crate) fn new() -> Self {
        let pool = Arc::new(PacketPool::default());
        let (a, a_out) =
            Netstack::new(&interface(&["10.0.0.2/24", "fd00::2/64"]), Arc::clone(&pool)).expect("stack a");
        let (b, b_out) = Netstack::new(&interface(&["10.0.0.1/24", "10.0.0.3/24", "fd00::1/64"]), pool)
            .expect("stack b");
        tokio::spawn(pump(a_out, b.clone()));
        tokio::spawn(pump(b_out, a.clone()));
        Self { a, b }
    }
}

fn interface(addresses: &[&str]) -> InterfaceConfig {
    InterfaceConfig {
        addresses: addresses.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}

async fn pump(mut rx: mpsc::Receiver<Packet>, to: Netstack) {
    while let Some(packet) = rx.recv().await {
        if to.inject(packet).is_err() {
            break;
        }
    }
}

#[derive(Default)]
struct Zone {
    records: HashMap<String, Vec<IpAddr>>,
    rcode: Option<RCode>,
    lame: bool,
    truncate_udp: bool,
    spoof_udp: bool,
}

/// A DNS server answering from a fixed zone over UDP and TCP.
///
/// Known names get their records (authoritative, recursion available);
/// unknown names get NXDOMAIN. The zone and behavior can be changed after
/// the server has started.
pub(crate) struct DnsServer {
    addr: SocketAddr,
    zone: Arc<Mutex<Zone>>,
    queries: Arc<AtomicUsize>,
    tcp_queries: Arc<AtomicUsize>,
}

impl DnsServer {
    /// Serve on 10.0.0.1:53 of `stack`.
    pub(crate) fn start(stack: &Netstack) -> Self {
        Self::on(stack, SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 53))
    }

    pub(crate) fn on(stack: &Netstack, addr: SocketAddr) -> Self {
        let server = Self {
            addr,
            zone: Arc::default(),
            queries: Arc::default(),
            tcp_queries: Arc::default(),
        };

        let udp = stack.listen_udp(addr).expect("dns udp bind");
        let zone = Arc::clone(&server.zone);
        let queries = Arc::clone(&server.queries);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((n, peer)) = udp.recv_from(&mut buf).await {
                queries.fetch_add(1, Ordering::SeqCst);
                let (reply, spoofed) = {
                    let zone = zone.lock();
                    let reply = answer(&zone, &buf[..n], zone.truncate_udp);
                    let spoofed = match &reply {
                        Some(reply) if zone.spoof_udp => mismatched_replies(reply),
                        _ => Vec::new(),
                    };
                    (reply, spoofed)
                };
                for datagram in spoofed.iter().chain(reply.as_ref()) {
                    let _ = udp.send_to(datagram, peer).await;
                }
            }
        });

        let tcp = stack.listen_tcp(addr).expect("dns tcp listen");
        let zone = Arc::clone(&server.zone);
        let queries = Arc::clone(&server.queries);
        let tcp_queries = Arc::clone(&server.tcp_queries);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = tcp.accept().await {
                let zone = Arc::clone(&zone);
                let queries = Arc::clone(&queries);
                let tcp_queries = Arc::clone(&tcp_queries);
                tokio::spawn(async move {
                    let mut len = [0u8; 2];
                    if stream.read_exact(&mut len).await.is_err() {
                        return;
                    }
                    let mut msg = vec![0u8; usize::from(u16::from_be_bytes(len))];
                    if stream.read_exact(&mut msg).await.is_err() {
                        return;
                    }
                    queries.fetch_add(1, Ordering::SeqCst);
                    tcp_queries.fetch_add(1, Ordering::SeqCst);
                    let reply = answer(&zone.lock(), &msg, false);
                    if let Some(reply) = reply {
                        let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
                        framed.extend_from_slice(&reply);
                        let _ = stream.write_all(&framed).await;
                        let _ = stream.shutdown().await;
                    }
                });
            }
        });

        server
    }

    pub(crate) fn a(self, name: &str, ip: Ipv4Addr) -> Self {
        self.record(name, IpAddr::V4(ip))
    }

    pub(crate) fn aaaa(self, name: &str, ip: Ipv6Addr) -> Self {
        self.record(name, IpAddr::V6(ip))
    }

    fn record(self, name: &str, ip: IpAddr) -> Self {
        self.zone
            .lock()
            .records
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(ip);
        self
    }

    /// Answer every query with `rcode` and no records.
    pub(crate) fn rcode(self, rcode: RCode) -> Self {
        self.zone.lock().rcode = Some(rcode);
        self
    }

    /// Answer with empty, non-authoritative, non-recursive responses.
    pub(crate) fn lame(self) -> Self {
        self.zone.lock().lame = true;
        self
    }

    /// Set the truncation bit on every UDP response and leave out the
    /// answers, so that clients must retry over TCP.
    pub(crate) fn truncate_udp(self) -> Self {
        self.zone.lock().truncate_udp = true;
        self
    }

    /// Precede every UDP answer with replies the client must discard: one
    /// with another ID, one for another question, and one with the
    /// response bit cleared.
    pub(crate) fn spoof_udp(self) -> Self {
        self.zone.lock().spoof_udp = true;
        self
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub(crate) fn tcp_queries(&self) -> usize {
        self.tcp_queries.load(Ordering::SeqCst)
    }
}

fn answer(zone: &Zone, query: &[u8], truncate: bool) -> Option<Vec<u8>> {
    let (mut parser, header) = Parser::start(query.to_vec()).ok()?;
    let question = parser.question().ok()?;
    let records = zone.records.get(&question.name.to_ascii_lowercase());
    let rcode = zone.rcode.unwrap_or(if records.is_some() || zone.lame {
        RCode::SUCCESS
    } else {
        RCode::NAME_ERROR
    });

    let mut builder = MessageBuilder::new(Header {
        id: header.id,
        response: true,
        authoritative: !zone.lame,
        truncated: truncate,
        recursion_desired: header.recursion_desired,
        recursion_available: !zone.lame,
        rcode,
        ..Default::default()
    });
    builder.question(&question).ok()?;
    if truncate || rcode != RCode::SUCCESS || zone.lame {
        return Some(builder.finish());
    }
    for ip in records.into_iter().flatten() {
        match (ip, question.qtype) {
            (IpAddr::V4(v4), TYPE_A) => builder.a_resource(&question.name, 60, *v4).ok()?,
            (IpAddr::V6(v6), TYPE_AAAA) => builder.aaaa_resource(&question.name, 60, *v6).ok()?,
            _ => {}
        }
    }
    Some(builder.finish())
}

fn mismatched_replies(reply: &[u8]) -> Vec<Vec<u8>> {
    let Ok((mut parser, header)) = Parser::start(reply.to_vec()) else {
        return Vec::new();
    };
    let Ok(question) = parser.question() else {
        return Vec::new();
    };

    let mut wrong_id = reply.to_vec();
    wrong_id[..2].copy_from_slice(&header.id.wrapping_add(1).to_be_bytes());

    let other = Question::new("spoofed.example.", question.qtype);
    let mut builder = MessageBuilder::new(header);
    builder.question(&other).ok();
    builder.a_resource(&other.name, 60, Ipv4Addr::new(10, 6, 6, 6)).ok();
    let wrong_question = builder.finish();

    let mut not_response = reply.to_vec();
    not_response[2] &= 0x7f;

    vec![wrong_id, wrong_question, not_response]
}
