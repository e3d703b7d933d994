//! Server and connection identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::PoolError;

/// Default port of a docdb server.
pub const DEFAULT_PORT: u16 = 27017;

/// Network address of one server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Create an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port` or `[ipv6]:port`.
    ///
    /// The port defaults to [`DEFAULT_PORT`].
    pub fn parse(value: &str) -> Result<Self, PoolError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(PoolError::Config("server address cannot be empty".into()));
        }

        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| PoolError::Config(format!("unterminated IPv6 literal: {value}")))?;
            match tail {
                "" => (host, None),
                tail => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(PoolError::Config(format!(
                            "invalid server address: {value}"
                        )));
                    }
                },
            }
        } else {
            match value.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (value, None),
            }
        };

        if host.is_empty() {
            return Err(PoolError::Config(format!("missing host in address: {value}")));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| PoolError::Config(format!("invalid port: {port}")))?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(host.to_ascii_lowercase(), port))
    }

    /// Host name or IP literal.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identity of a server within a cluster, as assigned by the topology layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId {
    /// Identifier of the cluster the server belongs to.
    pub cluster_id: u32,
    /// Server endpoint.
    pub address: ServerAddress,
}

impl ServerId {
    /// Create a server id.
    pub fn new(cluster_id: u32, address: ServerAddress) -> Self {
        Self {
            cluster_id,
            address,
        }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.cluster_id)
    }
}

/// Identifier of a logical backend behind a load balancer.
///
/// Reported by the server during the handshake; its text form is 24 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId([u8; 12]);

impl ServiceId {
    /// Wrap raw identifier bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Raw identifier bytes.
    #[must_use]
    pub const fn bytes(&self) -> [u8; 12] {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for ServiceId {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PoolError::Config(format!("invalid service id: {s}"));
        if s.len() != 24 || !s.is_ascii() {
            return Err(invalid());
        }

        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for ServiceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Pool-local connection identifier, assigned in creation order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// Numeric value of the id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
