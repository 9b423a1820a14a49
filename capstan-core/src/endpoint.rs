//! Endpoint abstraction for transport-agnostic socket addressing.
//!
//! Three schemes are understood:
//! - `tcp://host:port`: plain TCP, host may be `*` for wildcard binds
//!   and port may be `0` for an ephemeral port
//! - `ipc://path`: loopback TCP on a port derived from the path
//!   (see [`crate::ipc`])
//! - `inproc://name`: in-process pipe attachment, no network at all
//!
//! Host names are kept verbatim and resolved when a listener or connector
//! actually needs a network address.

use crate::ipc;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP transport: `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// IPC transport emulated over derived loopback ports: `ipc://path`
    Ipc(String),
    /// In-process transport: `inproc://name`
    Inproc(String),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// # Examples
    ///
    /// ```
    /// use capstan_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert!(endpoint.is_tcp());
    ///
    /// let endpoint = Endpoint::parse("ipc:///tmp/test.sock").unwrap();
    /// assert!(endpoint.is_ipc());
    ///
    /// let endpoint = Endpoint::parse("inproc://my-endpoint").unwrap();
    /// assert!(endpoint.is_inproc());
    /// ```
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Returns true if this is a TCP endpoint.
    #[must_use]
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp { .. })
    }

    /// Returns true if this is an IPC endpoint.
    #[must_use]
    pub fn is_ipc(&self) -> bool {
        matches!(self, Endpoint::Ipc(_))
    }

    /// Returns true if this is an inproc endpoint.
    #[must_use]
    pub fn is_inproc(&self) -> bool {
        matches!(self, Endpoint::Inproc(_))
    }

    /// Network address this endpoint maps to.
    ///
    /// TCP hosts are resolved here; `*` binds every interface. IPC paths
    /// map to their derived loopback port. Inproc endpoints have no
    /// network address and always fail.
    pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
        match self {
            Endpoint::Tcp { host, port } => {
                let host = match host.as_str() {
                    "*" => "0.0.0.0",
                    // Bracketed IPv6 literals resolve without the brackets.
                    h => h.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(h),
                };
                (host, *port)
                    .to_socket_addrs()
                    .map_err(|_| EndpointError::Unresolvable(self.to_string()))?
                    .next()
                    .ok_or_else(|| EndpointError::Unresolvable(self.to_string()))
            }
            Endpoint::Ipc(path) => Ok(ipc::loopback_addr(path)),
            Endpoint::Inproc(_) => Err(EndpointError::NoNetworkAddress(self.to_string())),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| EndpointError::InvalidTcpAddress(addr.to_string()))?;
            if host.is_empty() {
                return Err(EndpointError::InvalidTcpAddress(addr.to_string()));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidTcpAddress(addr.to_string()))?;
            Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            })
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(EndpointError::InvalidIpcPath(
                    "ipc path cannot be empty".to_string(),
                ));
            }
            Ok(Endpoint::Ipc(path.to_string()))
        } else if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(EndpointError::InvalidInprocName(
                    "inproc name cannot be empty".to_string(),
                ));
            }
            Ok(Endpoint::Inproc(name.to_string()))
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{path}"),
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}

/// Errors that can occur when parsing or resolving endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp://, ipc://, or inproc://)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("Invalid IPC path: {0}")]
    InvalidIpcPath(String),

    #[error("Invalid inproc name: {0}")]
    InvalidInprocName(String),

    #[error("Cannot resolve endpoint: {0}")]
    Unresolvable(String),

    #[error("Endpoint has no network address: {0}")]
    NoNetworkAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_ipv4() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:5555").unwrap();
        assert!(endpoint.is_tcp());
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:5555");
        assert_eq!(
            endpoint.socket_addr().unwrap(),
            "127.0.0.1:5555".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_parse_tcp_ipv6() {
        let endpoint = Endpoint::parse("tcp://[::1]:5555").unwrap();
        assert!(endpoint.is_tcp());
        let addr = endpoint.socket_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 5555);
    }

    #[test]
    fn test_wildcard_host() {
        let endpoint = Endpoint::parse("tcp://*:0").unwrap();
        let addr = endpoint.socket_addr().unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:0");
    }

    #[test]
    fn test_parse_ipc_maps_to_loopback() {
        let endpoint = Endpoint::parse("ipc:///tmp/test.sock").unwrap();
        assert!(endpoint.is_ipc());
        assert_eq!(endpoint.to_string(), "ipc:///tmp/test.sock");

        let addr = endpoint.socket_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert!(addr.port() >= 10_000);

        // The mapping is a pure function of the path.
        let again = Endpoint::parse("ipc:///tmp/test.sock").unwrap();
        assert_eq!(addr, again.socket_addr().unwrap());
    }

    #[test]
    fn test_parse_inproc() {
        let endpoint = Endpoint::parse("inproc://my-endpoint").unwrap();
        assert!(endpoint.is_inproc());
        assert_eq!(endpoint.to_string(), "inproc://my-endpoint");
        assert!(matches!(
            endpoint.socket_addr(),
            Err(EndpointError::NoNetworkAddress(_))
        ));
    }

    #[test]
    fn test_invalid_scheme() {
        let result = Endpoint::parse("http://127.0.0.1:5555");
        assert!(matches!(result, Err(EndpointError::InvalidScheme(_))));
    }

    #[test]
    fn test_invalid_tcp_address() {
        assert!(matches!(
            Endpoint::parse("tcp://no-port-here"),
            Err(EndpointError::InvalidTcpAddress(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://host:notaport"),
            Err(EndpointError::InvalidTcpAddress(_))
        ));
        assert!(matches!(
            Endpoint::parse("tcp://:5555"),
            Err(EndpointError::InvalidTcpAddress(_))
        ));
    }

    #[test]
    fn test_empty_names_rejected() {
        assert!(matches!(
            Endpoint::parse("inproc://"),
            Err(EndpointError::InvalidInprocName(_))
        ));
        assert!(matches!(
            Endpoint::parse("ipc://"),
            Err(EndpointError::InvalidIpcPath(_))
        ));
    }
}
