//! Endpoint configuration, loaded from TOML.
//!
//! ```toml
//! [interface]
//! addresses = ["10.0.0.2/24", "fd00::2/64"]
//! mtu = 1428
//!
//! [dns]
//! servers = ["10.0.0.1"]
//!
//! [[forward]]
//! listen = "tcp://127.0.0.1:8080"
//! backend = "tcp://10.0.0.1:80"
//! ```

use crate::error::{CoreError, CoreResult};
use crate::packet::DEFAULT_MTU;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Schemes a forward rule may use on either side.
const FORWARD_SCHEMES: &[&str] = &["tcp", "tcp4", "tcp6", "udp", "udp4", "udp6"];

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Virtual interface settings.
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Stub resolver settings.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Port forwarding rules.
    #[serde(default, rename = "forward")]
    pub forwards: Vec<ForwardRule>,
}

/// Addresses and MTU of the virtual interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface addresses in CIDR notation. A bare address is a host route.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Largest IP packet the interface sends or accepts, in bytes.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            mtu: default_mtu(),
        }
    }
}

impl InterfaceConfig {
    /// Parse [`addresses`](Self::addresses) into `(address, prefix length)`.
    pub fn cidrs(&self) -> CoreResult<Vec<(IpAddr, u8)>> {
        self.addresses.iter().map(|s| parse_cidr(s)).collect()
    }
}

/// DNS servers and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Servers to query, in order. Reached through the virtual interface.
    #[serde(default)]
    pub servers: Vec<IpAddr>,

    /// Full passes over the server list.
    #[serde(default = "default_attempts")]
    pub attempts: usize,

    /// Per-exchange timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Port queried on every server.
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            attempts: default_attempts(),
            timeout_secs: default_timeout_secs(),
            port: default_dns_port(),
        }
    }
}

impl DnsConfig {
    /// [`timeout_secs`](Self::timeout_secs) as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A static mapping from a virtual-stack listener to a host-network backend.
///
/// ```
/// let rule: vnic_core::ForwardRule = toml::from_str(
///     "listen = \"tcp://0.0.0.0:8080\"\nbackend = \"tcp://127.0.0.1:80\"",
/// )
/// .unwrap();
/// assert_eq!(rule.listen.scheme, "tcp");
/// assert_eq!(rule.backend.address, "127.0.0.1:80");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    /// Where peers on the virtual network connect. The host part is
    /// ignored: the port is opened on every interface address, and the
    /// scheme's family suffix picks IPv4 or IPv6.
    pub listen: Target,
    /// Host-network address each accepted connection is relayed to. Names
    /// are resolved by the host.
    pub backend: Target,
}

/// A `scheme://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target {
    /// `tcp` or `udp`, optionally suffixed with `4` or `6`.
    pub scheme: String,
    /// `host:port`, unparsed.
    pub address: String,
}

impl FromStr for Target {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let (scheme, address) = s
            .split_once("://")
            .ok_or_else(|| CoreError::InvalidTarget(s.to_string(), "missing scheme".into()))?;
        if !FORWARD_SCHEMES.contains(&scheme) {
            return Err(CoreError::InvalidTarget(
                s.to_string(),
                format!("unknown scheme {scheme:?}"),
            ));
        }
        if address.is_empty() {
            return Err(CoreError::InvalidTarget(s.to_string(), "missing address".into()));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            address: address.to_string(),
        })
    }
}

impl TryFrom<String> for Target {
    type Error = CoreError;

    fn try_from(s: String) -> CoreResult<Self> {
        s.parse()
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        t.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_attempts() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_dns_port() -> u16 {
    53
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist. A leading `~/` is expanded to the home directory.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = expand_tilde(path.as_ref());
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)?;
        debug!(
            path = %path.display(),
            forwards = config.forwards.len(),
            servers = config.dns.servers.len(),
            "loaded config"
        );
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.interface.cidrs()?;
        if config.dns.attempts == 0 {
            return Err(CoreError::Config("dns.attempts must be at least 1".into()));
        }
        Ok(config)
    }
}

fn parse_cidr(s: &str) -> CoreResult<(IpAddr, u8)> {
    let invalid = || CoreError::InvalidAddress(s.to_string());
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
            let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
            (addr, prefix)
        }
        None => {
            let addr: IpAddr = s.parse().map_err(|_| invalid())?;
            (addr, if addr.is_ipv4() { 32 } else { 128 })
        }
    };
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.interface.mtu, 1428);
        assert_eq!(config.dns.attempts, 2);
        assert_eq!(config.dns.timeout(), Duration::from_secs(5));
        assert_eq!(config.dns.port, 53);
        assert!(config.forwards.is_empty());
    }

    #[test]
    fn full_document() {
        let toml = r#"
[interface]
addresses = ["10.0.0.2/24", "fd00::2"]
mtu = 1280

[dns]
servers = ["10.0.0.1", "fd00::1"]
attempts = 3
timeout_secs = 2

[[forward]]
listen = "tcp://127.0.0.1:8080"
backend = "tcp://10.0.0.1:80"

[[forward]]
listen = "udp6://[::1]:5353"
backend = "udp://10.0.0.1:53"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.interface.mtu, 1280);
        let cidrs = config.interface.cidrs().unwrap();
        assert_eq!(cidrs[0], ("10.0.0.2".parse().unwrap(), 24));
        assert_eq!(cidrs[1], ("fd00::2".parse().unwrap(), 128));
        assert_eq!(config.dns.servers.len(), 2);
        assert_eq!(config.dns.attempts, 3);

        assert_eq!(config.forwards.len(), 2);
        assert_eq!(config.forwards[0].listen.scheme, "tcp");
        assert_eq!(config.forwards[0].listen.address, "127.0.0.1:8080");
        assert_eq!(config.forwards[1].listen.scheme, "udp6");
        assert_eq!(config.forwards[1].listen.address, "[::1]:5353");
        assert_eq!(config.forwards[1].backend.to_string(), "udp://10.0.0.1:53");
    }

    #[test]
    fn module_example_parses() {
        let doc = include_str!("config.rs")
            .lines()
            .map_while(|line| line.strip_prefix("//!"))
            .skip_while(|line| line.trim() != "```toml")
            .skip(1)
            .take_while(|line| line.trim() != "```")
            .map(str::trim_start)
            .collect::<Vec<_>>()
            .join("\n");
        let config = Config::from_toml(&doc).unwrap();
        assert_eq!(config.interface.mtu, 1428);
        assert_eq!(config.dns.servers, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.forwards.len(), 1);
        assert_eq!(config.forwards[0].listen.scheme, "tcp");
        assert_eq!(config.forwards[0].backend.address, "10.0.0.1:80");
    }

    #[test]
    fn rejects_unknown_scheme() {
        let toml = r#"
[[forward]]
listen = "sctp://127.0.0.1:1"
backend = "tcp://10.0.0.1:80"
"#;
        assert!(Config::from_toml(toml).is_err());
        assert!("127.0.0.1:80".parse::<Target>().is_err());
        assert!("tcp://".parse::<Target>().is_err());
    }

    #[test]
    fn rejects_bad_cidr() {
        let toml = r#"
[interface]
addresses = ["10.0.0.2/40"]
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dns]\nservers = [\"1.1.1.1\"]").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.dns.servers, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert!(config.interface.addresses.is_empty());
    }
}
