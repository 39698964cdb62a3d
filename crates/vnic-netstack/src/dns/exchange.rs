//! A single DNS query/response exchange with one server.

use super::message::{Header, MessageBuilder, MessageError, Parser, Question};
use crate::context::Context;
use crate::error::{DnsError, DnsErrorKind, NetError, NetResult};
use crate::stack::{Netstack, TcpStream, UdpSocket};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

/// Largest response accepted over UDP (no EDNS0).
const UDP_MESSAGE_SIZE: usize = 512;

/// A query encoded for both transports. `tcp` carries the two-byte length
/// prefix; `udp` is the bare message.
pub(crate) struct Request {
    pub(crate) id: u16,
    pub(crate) udp: Vec<u8>,
    pub(crate) tcp: Vec<u8>,
}

/// Encode `q` under a fresh random ID, asking for recursion.
pub(crate) fn new_request(q: &Question) -> Result<Request, MessageError> {
    let id: u16 = rand::random();
    let mut builder = MessageBuilder::new(Header {
        id,
        recursion_desired: true,
        ..Default::default()
    });
    builder.question(q)?;
    let udp = builder.finish();

    let len = u16::try_from(udp.len()).map_err(|_| MessageError::NameTooLong)?;
    let mut tcp = Vec::with_capacity(udp.len() + 2);
    tcp.extend_from_slice(&len.to_be_bytes());
    tcp.extend_from_slice(&udp);
    Ok(Request { id, udp, tcp })
}

/// Whether a response header and echoed question answer the request.
pub(crate) fn check_response(id: u16, question: &Question, header: &Header, echoed: &Question) -> bool {
    header.response && header.id == id && question.matches(echoed)
}

fn dns_error(kind: DnsErrorKind, q: &Question) -> NetError {
    NetError::Dns(DnsError::new(kind, q.name.clone()))
}

/// Send over a connected UDP socket and wait for the matching reply.
/// Anything that does not parse or does not match is ignored.
async fn packet_round_trip(
    socket: &UdpSocket,
    id: u16,
    question: &Question,
    request: &[u8],
) -> NetResult<(Parser, Header)> {
    socket.send(request).await?;
    let mut buf = vec![0u8; UDP_MESSAGE_SIZE];
    loop {
        let n = socket.recv(&mut buf).await?;
        let Ok((mut parser, header)) = Parser::start(buf[..n].to_vec()) else {
            trace!(len = n, "ignoring unparsable DNS datagram");
            continue;
        };
        match parser.question() {
            Ok(echoed) if check_response(id, question, &header, &echoed) => {
                return Ok((parser, header));
            }
            _ => trace!(id = header.id, "ignoring mismatched DNS response"),
        }
    }
}

/// Send over TCP with the length prefix and read exactly one reply.
async fn stream_round_trip(
    stream: &mut TcpStream,
    id: u16,
    question: &Question,
    request: &[u8],
) -> NetResult<(Parser, Header)> {
    stream.write_all(request).await?;
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream.read_exact(&mut buf).await?;

    let (mut parser, header) =
        Parser::start(buf).map_err(|_| dns_error(DnsErrorKind::CannotUnmarshal, question))?;
    let echoed = parser
        .question()
        .map_err(|_| dns_error(DnsErrorKind::CannotUnmarshal, question))?;
    if !check_response(id, question, &header, &echoed) {
        return Err(dns_error(DnsErrorKind::InvalidResponse, question));
    }
    Ok((parser, header))
}

/// Ask `server` the question `q`, first over UDP and, if the answer comes
/// back truncated, again over TCP with the same ID. Each transport gets its
/// own `timeout`, bounded by `ctx`.
///
/// Returns the parser positioned at the answer section.
///
/// # Errors
///
/// Transport failures and context expiry are returned as they are.
/// A response with more than one question is
/// [`DnsErrorKind::InvalidResponse`]; truncation on both transports is
/// [`DnsErrorKind::NoAnswer`].
pub async fn exchange(
    stack: &Netstack,
    ctx: &Context,
    server: SocketAddr,
    q: &Question,
    timeout: Duration,
) -> NetResult<(Parser, Header)> {
    let request = new_request(q).map_err(|_| dns_error(DnsErrorKind::CannotMarshal, q))?;

    for use_udp in [true, false] {
        let ctx = ctx.with_timeout(timeout);
        let (mut parser, header) = if use_udp {
            let socket = stack.dial_udp(None, Some(server))?;
            ctx.run(packet_round_trip(&socket, request.id, q, &request.udp))
                .await?
        } else {
            let mut stream = stack.dial_tcp(&ctx, server).await?;
            ctx.run(stream_round_trip(&mut stream, request.id, q, &request.tcp))
                .await?
        };

        if parser.question() != Err(MessageError::SectionDone) {
            return Err(dns_error(DnsErrorKind::InvalidResponse, q));
        }
        if header.truncated {
            trace!(server = %server, name = %q.name, "truncated DNS response, retrying over TCP");
            continue;
        }
        return Ok((parser, header));
    }

    Err(dns_error(DnsErrorKind::NoAnswer, q))
}
