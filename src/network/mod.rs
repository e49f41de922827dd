//! Network module for probes, packet helpers and evasion timing

pub mod arp;
pub mod icmp;
pub mod probe;
pub mod stealth;

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

pub use probe::{IcmpProbe, Probe, ProbeSet, TcpProbe, UdpProbe};

/// Transport used for a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// ICMP has no ports; it is scanned once per host as pseudo-port 0
    pub fn is_port_based(&self) -> bool {
        !matches!(self, Protocol::Icmp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = crate::ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" | "ping" => Ok(Protocol::Icmp),
            other => Err(crate::ScanError::ConfigError(format!(
                "Unknown protocol: {}",
                other
            ))),
        }
    }
}

/// Port state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
        }
    }
}

/// Classification of one `(host, port, protocol)` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortResult {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    #[serde(with = "duration_millis")]
    pub response_time: Duration,
    /// Set when the probe failed and the state was degraded to filtered
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl PortResult {
    pub fn new(host: IpAddr, port: u16, protocol: Protocol, state: PortState) -> Self {
        Self {
            host,
            port,
            protocol,
            state,
            response_time: Duration::from_millis(0),
            error: None,
        }
    }

    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = response_time;
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
