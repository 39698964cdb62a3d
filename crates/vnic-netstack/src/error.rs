//! Error taxonomy for the virtual stack layer.
//!
//! Every layer that accepts a [`Context`](crate::Context) reports expiry as
//! [`NetError::Timeout`] and cancellation as [`NetError::Canceled`]; the two
//! are never folded together.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error("i/o timeout")]
    Timeout,

    #[error("operation was canceled")]
    Canceled,

    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("address {0}: port must be numeric")]
    NumericPort(String),

    #[error("address {0}: {1}")]
    InvalidAddress(String, &'static str),

    #[error("no suitable address found")]
    NoSuitableAddress,

    #[error("missing address")]
    MissingAddress,

    #[error("ping write: mismatched protocols")]
    ProtocolMismatch,

    #[error("not implemented")]
    NotImplemented,

    #[error("connection refused")]
    Refused,

    /// The underlying stack rejected an endpoint operation.
    #[error("{op}: {message}")]
    Stack { op: &'static str, message: String },

    #[error("network stack closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A failure annotated with the operation and peer that produced it.
    #[error("{op} {addr}: {source}")]
    Op {
        op: String,
        addr: String,
        #[source]
        source: Box<NetError>,
    },
}

pub type NetResult<T> = Result<T, NetError>;

impl NetError {
    pub(crate) fn stack(op: &'static str, err: impl fmt::Debug) -> Self {
        Self::Stack {
            op,
            message: format!("{err:?}"),
        }
    }

    pub(crate) fn op(op: impl Into<String>, addr: impl fmt::Display, source: NetError) -> Self {
        Self::Op {
            op: op.into(),
            addr: addr.to_string(),
            source: Box::new(source),
        }
    }

    /// Whether the failure is a deadline expiry, at any wrapping depth.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Dns(e) => e.is_timeout(),
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            Self::Op { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether the failure is a caller cancellation, at any wrapping depth.
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Dns(e) => e.kind == DnsErrorKind::Canceled,
            Self::Op { source, .. } => source.is_canceled(),
            _ => false,
        }
    }

    /// The resolver error inside, if any.
    pub fn as_dns(&self) -> Option<&DnsError> {
        match self {
            Self::Dns(e) => Some(e),
            Self::Op { source, .. } => source.as_dns(),
            _ => None,
        }
    }
}

impl From<NetError> for io::Error {
    fn from(err: NetError) -> Self {
        if let NetError::Io(e) = err {
            return e;
        }
        let kind = match &err {
            NetError::Timeout => io::ErrorKind::TimedOut,
            NetError::Canceled => io::ErrorKind::Interrupted,
            NetError::Closed => io::ErrorKind::NotConnected,
            NetError::Refused => io::ErrorKind::ConnectionRefused,
            NetError::NotImplemented => io::ErrorKind::Unsupported,
            NetError::ProtocolMismatch
            | NetError::InvalidAddress(..)
            | NetError::NumericPort(_)
            | NetError::UnknownNetwork(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

// ── Resolver errors ─────────────────────────────────────────────────

/// Why a lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsErrorKind {
    #[error("no such host")]
    NotFound,
    #[error("lame referral")]
    LameReferral,
    #[error("cannot unmarshal DNS message")]
    CannotUnmarshal,
    #[error("cannot marshal DNS message")]
    CannotMarshal,
    #[error("server misbehaving")]
    ServerMisbehaving,
    #[error("invalid DNS response")]
    InvalidResponse,
    #[error("no answer from DNS server")]
    NoAnswer,
    #[error("i/o timeout")]
    Timeout,
    #[error("operation was canceled")]
    Canceled,
    /// The exchange failed below the DNS layer (socket or stack error).
    #[error("{0}")]
    Transport(String),
}

impl From<&NetError> for DnsErrorKind {
    fn from(err: &NetError) -> Self {
        if err.is_canceled() {
            return Self::Canceled;
        }
        if err.is_timeout() {
            return Self::Timeout;
        }
        match err.as_dns() {
            Some(e) => e.kind.clone(),
            None => Self::Transport(err.to_string()),
        }
    }
}

/// A failed lookup of `name`, optionally attributed to one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsError {
    pub kind: DnsErrorKind,
    pub name: String,
    pub server: Option<SocketAddr>,
    /// The failure may clear up on retry.
    pub temporary: bool,
}

impl DnsError {
    pub fn new(kind: DnsErrorKind, name: impl Into<String>) -> Self {
        let temporary = matches!(kind, DnsErrorKind::Transport(_));
        Self {
            kind,
            name: name.into(),
            server: None,
            temporary,
        }
    }

    pub(crate) fn on(mut self, server: SocketAddr) -> Self {
        self.server = Some(server);
        self
    }

    pub(crate) fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == DnsErrorKind::NotFound
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == DnsErrorKind::Timeout
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary || self.is_timeout()
    }
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lookup {}", self.name)?;
        if let Some(server) = self.server {
            write!(f, " on {server}")?;
        }
        write!(f, ": {}", self.kind)
    }
}

impl std::error::Error for DnsError {}
