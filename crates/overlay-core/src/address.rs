//! Address: host + port identifying a reachable peer endpoint.
//!
//! Wraps a host string and a port but displays as `"host:port"` for
//! human readability and a compact wire/JSON representation.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid address format: expected host:port")]
    InvalidFormat,
    #[error("Invalid port: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// A reachable peer endpoint.
///
/// Value type: hashable and comparable so it can live in sets and maps
/// (ban list, peer group, connection registries).
///
/// # Examples
/// ```
/// use overlay_core::Address;
///
/// let address = Address::new("10.0.0.1", 8333);
/// assert_eq!(address.to_string(), "10.0.0.1:8333");
///
/// let parsed: Address = "10.0.0.1:8333".parse().unwrap();
/// assert_eq!(parsed, address);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create a new address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback address on the given port, handy in tests and local setups.
    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split on the last ':' so IPv6-ish hosts with colons keep working.
        let (host, port) = s.rsplit_once(':').ok_or(AddressError::InvalidFormat)?;
        if host.is_empty() {
            return Err(AddressError::InvalidFormat);
        }
        let port: u16 = port.parse()?;
        Ok(Self::new(host, port))
    }
}

// Serialize as "host:port" for consistency in logs, errors, JSON
impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
