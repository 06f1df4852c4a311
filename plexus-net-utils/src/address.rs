//! Node address parsing.
//!
//! A node identifier is the only naming the runtime knows: a Unix domain
//! socket path (absolute or explicitly relative) or a TCP `host:port` pair
//! with hostnames left unresolved until connect time.

use std::fmt::{self, Display, Formatter};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::net::SocketAddr as UnixSocketAddr;
use std::str::FromStr;

use camino::Utf8PathBuf;

/// Errors that can occur when parsing a [`NodeAddress`].
#[derive(thiserror::Error, Debug, Clone)]
pub enum NodeAddressParseError {
    /// Missing ':' separator between host and port (and not a Unix path).
    #[error("missing ':' separator (Unix paths must start with '/', './', or '../')")]
    MissingSeparator,

    /// Invalid port number format.
    #[error("invalid port number")]
    InvalidPortNumber(#[source] std::num::ParseIntError),

    /// Invalid hostname format.
    #[error("invalid hostname: {0}")]
    InvalidHostname(&'static str),
}

/// Where a peer node can be reached.
///
/// Parsed but not resolved; a hostname stays a hostname until the connection
/// is made. See the tests for the accepted syntax.
#[derive(Debug, Clone)]
pub enum NodeAddress {
    /// Unix domain socket path.
    Unix(Utf8PathBuf),

    /// TCP endpoint with hostname/IP and port.
    Tcp {
        /// Hostname, IPv4 or IPv6 address.
        host: String,

        // IPv6 is the only case where the text form is not `{host}:{port}`,
        // it has extra `[]` around the IP to distinguish from the port.
        is_v6: bool,

        /// Port number.
        port: u16,
    },
}

impl NodeAddress {
    /// Returns something usable with Tokio's `ToSocketAddrs` for a TCP
    /// address, `None` for a Unix path.
    pub fn as_tcp_socket_addrs(&self) -> Option<(String, u16)> {
        match self {
            Self::Unix(_) => None,
            Self::Tcp { host, port, .. } => Some((host.clone(), *port)),
        }
    }

    /// The port of a TCP address, `None` for a Unix path.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Unix(_) => None,
            Self::Tcp { port, .. } => Some(*port),
        }
    }
}

impl ToSocketAddrs for NodeAddress {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        match self {
            Self::Unix(_) => Ok(Vec::new().into_iter()),
            Self::Tcp { host, port, .. } => {
                Ok((host.as_str(), *port).to_socket_addrs()?.collect::<Vec<_>>().into_iter())
            }
        }
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => path.fmt(f),
            Self::Tcp { host, is_v6, port } => {
                if *is_v6 {
                    write!(f, "[{host}]:{port}")
                } else {
                    write!(f, "{host}:{port}")
                }
            }
        }
    }
}

/// Validates a hostname according to [RFC 1123 §2.1] + [RFC 952] syntax
/// rules:
///
/// - Total length <= 253 characters
/// - Each label (part between dots) <= 63 characters
/// - Labels contain only alphanumeric characters and hyphens
/// - Labels cannot start or end with hyphens
/// - Trailing dot allowed for Fully Qualified Domain Name (FQDN)
///
/// [RFC 1123 §2.1]: https://datatracker.ietf.org/doc/html/rfc1123#section-2
/// [RFC 952]: https://datatracker.ietf.org/doc/html/rfc952
fn validate_hostname(host: &str) -> Result<(), NodeAddressParseError> {
    if host.is_empty() {
        return Err(NodeAddressParseError::InvalidHostname("is empty"));
    }

    if host.len() > 253 {
        return Err(NodeAddressParseError::InvalidHostname("is too long"));
    }

    if host.starts_with('.') {
        return Err(NodeAddressParseError::InvalidHostname("starts with period"));
    }

    // Strip a trailing `.` to allow for FQDN.
    for label in host.strip_suffix('.').unwrap_or(host).split('.') {
        if label.is_empty() {
            return Err(NodeAddressParseError::InvalidHostname(
                "contains empty label",
            ));
        }

        if label.len() > 63 {
            return Err(NodeAddressParseError::InvalidHostname("label too long"));
        }

        if label.starts_with('-') {
            return Err(NodeAddressParseError::InvalidHostname(
                "label starts with dash",
            ));
        }

        if label.ends_with('-') {
            return Err(NodeAddressParseError::InvalidHostname(
                "label ends with dash",
            ));
        }

        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(NodeAddressParseError::InvalidHostname(
                "label contains disallowed character",
            ));
        }
    }

    Ok(())
}

impl FromStr for NodeAddress {
    type Err = NodeAddressParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        // Unix socket paths must be absolute or explicit relative paths.
        if string.starts_with('/') || string.starts_with("./") || string.starts_with("../") {
            return Ok(NodeAddress::Unix(string.into()));
        }

        let (host, port) = string
            .rsplit_once(":")
            .ok_or(NodeAddressParseError::MissingSeparator)?;

        let port = port
            .parse()
            .map_err(NodeAddressParseError::InvalidPortNumber)?;

        fn is_ipv4(host: &str) -> bool {
            std::net::Ipv4Addr::from_str(host).is_ok()
        }

        fn is_ipv6(host: &str) -> Option<&str> {
            let host = host.strip_prefix('[')?.strip_suffix(']')?;
            std::net::Ipv6Addr::from_str(host).is_ok().then_some(host)
        }

        if let Some(host) = is_ipv6(host) {
            Ok(NodeAddress::Tcp {
                host: host.to_owned(),
                is_v6: true,
                port,
            })
        } else {
            if !is_ipv4(host) {
                validate_hostname(host)?;
            }
            Ok(NodeAddress::Tcp {
                host: host.to_owned(),
                is_v6: false,
                port,
            })
        }
    }
}

/// A connected peer's resolved address, for diagnostics.
#[derive(Debug, Clone)]
pub enum PeerAddress {
    /// Unix domain socket peer.
    Unix(UnixSocketAddr),

    /// TCP peer.
    Tcp(SocketAddr),
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            // Unix socket addresses only implement Debug.
            Self::Unix(address) => fmt::Debug::fmt(address, f),
            Self::Tcp(address) => address.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeAddress, NodeAddressParseError};
    use std::net::ToSocketAddrs;
    use std::str::FromStr;

    fn parse(string: &str) -> NodeAddress {
        NodeAddress::from_str(string)
            .unwrap_or_else(|error| panic!("failed to parse {string}: {error}"))
    }

    #[test]
    fn tcp_parsing() {
        assert!(matches!(parse("localhost:8080"), NodeAddress::Tcp { .. }));
        assert!(matches!(parse("127.0.0.1:8080"), NodeAddress::Tcp { .. }));
        assert!(matches!(
            parse("[2001:db8::cafe]:8888"),
            NodeAddress::Tcp { is_v6: true, .. }
        ));
        assert_eq!(parse("example.com.:80").to_string(), "example.com.:80");

        let resolved: Vec<_> = parse("127.0.0.1:8080").to_socket_addrs().unwrap().collect();
        assert_eq!(resolved, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn unix_parsing() {
        assert!(matches!(parse("/run/plexus/node.sock"), NodeAddress::Unix(_)));
        assert!(matches!(parse("./node.sock"), NodeAddress::Unix(_)));
        assert!(matches!(parse("../node.sock"), NodeAddress::Unix(_)));
    }

    #[test]
    fn rejects() {
        assert!(matches!(
            NodeAddress::from_str("just-a-filename"),
            Err(NodeAddressParseError::MissingSeparator),
        ));
        assert!(matches!(
            NodeAddress::from_str("relative/path"),
            Err(NodeAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            NodeAddress::from_str("example.com:http"),
            Err(NodeAddressParseError::InvalidPortNumber(_)),
        ));
        assert!(matches!(
            NodeAddress::from_str(":80"),
            Err(NodeAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            NodeAddress::from_str("-example.com:80"),
            Err(NodeAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            NodeAddress::from_str("foo..example.com:80"),
            Err(NodeAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            NodeAddress::from_str("2001:db8::cafe:80"),
            Err(NodeAddressParseError::InvalidHostname(_)),
        ));
    }

    #[test]
    fn display_round_trips() {
        for text in ["/tmp/a.sock", "localhost:1234", "[2001:db8::cafe]:8888"] {
            assert_eq!(parse(text).to_string(), text);
        }
    }
}
