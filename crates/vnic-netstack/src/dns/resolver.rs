//! Host lookups against the configured upstream servers.

use super::exchange::exchange;
use super::is_domain_name;
use super::message::{Header, MessageError, Parser, Question, RCode, TYPE_A, TYPE_AAAA};
use crate::context::Context;
use crate::error::{DnsError, DnsErrorKind, NetError, NetResult};
use crate::stack::Netstack;
use futures_util::future::join_all;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;
use vnic_core::DnsConfig;

/// Retry policy of a [`Resolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Passes over the whole server list.
    pub attempts: usize,
    /// Bound on each transport try of a single exchange.
    pub timeout: Duration,
    /// Port queried on every server.
    pub port: u16,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            timeout: Duration::from_secs(5),
            port: 53,
        }
    }
}

impl From<&DnsConfig> for ResolverConfig {
    fn from(config: &DnsConfig) -> Self {
        Self {
            attempts: config.attempts,
            timeout: config.timeout(),
            port: config.port,
        }
    }
}

/// Resolves host names by querying DNS servers through the virtual stack.
///
/// Address families follow the stack's interface addresses unless
/// overridden with [`with_families`](Self::with_families).
#[derive(Debug, Clone)]
pub struct Resolver {
    stack: Netstack,
    servers: Vec<IpAddr>,
    config: ResolverConfig,
    v4: bool,
    v6: bool,
}

impl Resolver {
    pub fn new(stack: Netstack, servers: Vec<IpAddr>) -> Self {
        let (v4, v6) = (stack.has_v4(), stack.has_v6());
        Self {
            stack,
            servers,
            config: ResolverConfig::default(),
            v4,
            v6,
        }
    }

    pub fn from_config(stack: Netstack, config: &DnsConfig) -> Self {
        Self::new(stack, config.servers.clone()).with_config(config.into())
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Choose which record types are queried: A for `v4`, AAAA for `v6`.
    pub fn with_families(mut self, v4: bool, v6: bool) -> Self {
        self.v4 = v4;
        self.v6 = v6;
        self
    }

    pub fn servers(&self) -> &[IpAddr] {
        &self.servers
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `host` to textual addresses. See [`lookup_ip`](Self::lookup_ip).
    pub async fn lookup_host(&self, ctx: &Context, host: &str) -> NetResult<Vec<String>> {
        let addrs = self.lookup_ip(ctx, host).await?;
        Ok(addrs.iter().map(IpAddr::to_string).collect())
    }

    /// Resolve `host` to IP addresses.
    ///
    /// A literal address (an IPv6 zone suffix is ignored) is returned as is.
    /// Otherwise A and AAAA lookups run concurrently, one per enabled
    /// family. When IPv6 is enabled its addresses come first.
    ///
    /// # Errors
    ///
    /// [`DnsErrorKind::NotFound`] for an empty or malformed name, or when no
    /// family is enabled. If no address is found, the first failing lane's
    /// error, or a later answer that failed to parse.
    pub async fn lookup_ip(&self, ctx: &Context, host: &str) -> NetResult<Vec<IpAddr>> {
        let not_found = || NetError::Dns(DnsError::new(DnsErrorKind::NotFound, host));
        if host.is_empty() || (!self.v4 && !self.v6) {
            return Err(not_found());
        }

        let literal = match host.rfind('%') {
            Some(zone) if host.contains(':') => &host[..zone],
            _ => host,
        };
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if !is_domain_name(host) {
            return Err(not_found());
        }

        let fqdn = if host.ends_with('.') {
            host.to_string()
        } else {
            format!("{host}.")
        };
        let mut lanes = Vec::with_capacity(2);
        if self.v4 {
            lanes.push(self.try_one_name(ctx, &fqdn, TYPE_A));
        }
        if self.v6 {
            lanes.push(self.try_one_name(ctx, &fqdn, TYPE_AAAA));
        }

        let mut addrs_v4 = Vec::new();
        let mut addrs_v6 = Vec::new();
        let mut last_err: Option<DnsError> = None;
        for result in join_all(lanes).await {
            let (mut parser, server) = match result {
                Ok(found) => found,
                Err(e) => {
                    last_err.get_or_insert(e);
                    continue;
                }
            };
            if let Err(e) = collect_answers(&mut parser, &mut addrs_v4, &mut addrs_v6) {
                debug!(name = host, server = %server, error = %e, "malformed DNS answer");
                last_err = Some(DnsError::new(DnsErrorKind::CannotUnmarshal, host).on(server));
            }
        }

        // No RFC 6724 sorting: IPv6 first whenever it is enabled.
        let addrs: Vec<IpAddr> = if self.v6 {
            addrs_v6.into_iter().chain(addrs_v4).collect()
        } else {
            addrs_v4.into_iter().chain(addrs_v6).collect()
        };
        match last_err {
            Some(e) if addrs.is_empty() => Err(e.into()),
            _ => Ok(addrs),
        }
    }

    /// Query every server in order, for the configured number of passes,
    /// until one gives a definitive answer for `name`.
    ///
    /// On success the parser is positioned at the first answer of type
    /// `qtype`.
    async fn try_one_name(
        &self,
        ctx: &Context,
        name: &str,
        qtype: u16,
    ) -> Result<(Parser, SocketAddr), DnsError> {
        let question = Question::new(name, qtype);
        let mut last_err = None;

        for _ in 0..self.config.attempts {
            for &server in &self.servers {
                let server = SocketAddr::new(server, self.config.port);
                let (mut parser, header) =
                    match exchange(&self.stack, ctx, server, &question, self.config.timeout).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            debug!(name, server = %server, error = %e, "DNS exchange failed");
                            last_err = Some(DnsError::new(DnsErrorKind::from(&e), name).on(server));
                            continue;
                        }
                    };

                if let Err(kind) = check_header(&mut parser, &header) {
                    let mut err = DnsError::new(kind, name).on(server);
                    if header.rcode == RCode::SERVER_FAILURE {
                        err = err.temporary();
                    }
                    if err.is_not_found() {
                        return Err(err);
                    }
                    last_err = Some(err);
                    continue;
                }

                match skip_to_answer(&mut parser, qtype) {
                    Ok(()) => return Ok((parser, server)),
                    Err(kind) => {
                        let err = DnsError::new(kind, name).on(server);
                        if err.is_not_found() {
                            return Err(err);
                        }
                        last_err = Some(err);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DnsError::new(DnsErrorKind::NoAnswer, name)))
    }
}

/// Classify a response by its header and whether it carries answers.
fn check_header(parser: &mut Parser, header: &Header) -> Result<(), DnsErrorKind> {
    if header.rcode == RCode::NAME_ERROR {
        return Err(DnsErrorKind::NotFound);
    }
    let no_answers = match parser.answer_header() {
        Ok(_) => false,
        Err(MessageError::SectionDone) => true,
        Err(_) => return Err(DnsErrorKind::CannotUnmarshal),
    };
    if header.rcode == RCode::SUCCESS
        && !header.authoritative
        && !header.recursion_available
        && no_answers
    {
        return Err(DnsErrorKind::LameReferral);
    }
    if header.rcode != RCode::SUCCESS {
        return Err(DnsErrorKind::ServerMisbehaving);
    }
    Ok(())
}

/// Advance to the first answer of type `qtype`, leaving its header
/// unconsumed.
fn skip_to_answer(parser: &mut Parser, qtype: u16) -> Result<(), DnsErrorKind> {
    loop {
        match parser.answer_header() {
            Ok(header) if header.rtype == qtype => return Ok(()),
            Ok(_) => parser
                .skip_answer()
                .map_err(|_| DnsErrorKind::CannotUnmarshal)?,
            Err(MessageError::SectionDone) => return Err(DnsErrorKind::NotFound),
            Err(_) => return Err(DnsErrorKind::CannotUnmarshal),
        }
    }
}

/// Gather every A and AAAA record left in the answer section.
fn collect_answers(
    parser: &mut Parser,
    v4: &mut Vec<IpAddr>,
    v6: &mut Vec<IpAddr>,
) -> Result<(), MessageError> {
    loop {
        let header = match parser.answer_header() {
            Ok(header) => header,
            Err(MessageError::SectionDone) => return Ok(()),
            Err(e) => return Err(e),
        };
        match header.rtype {
            TYPE_A => v4.push(IpAddr::V4(parser.a_resource()?)),
            TYPE_AAAA => v6.push(IpAddr::V6(parser.aaaa_resource()?)),
            _ => parser.skip_answer()?,
        }
    }
}
