//! Target enumeration for CIDR expressions
//!
//! Expands one or more comma-separated network expressions into a finite,
//! deduplicated, order-stable list of addresses. Parsing happens before any
//! network activity so a malformed target aborts the run cleanly.

use crate::{Result, ScanError};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

/// Upper bound on expanded addresses
pub const DEFAULT_MAX_ADDRESSES: usize = 65_536;

/// Expands network expressions into probe targets
#[derive(Debug, Clone)]
pub struct TargetEnumerator {
    max_addresses: usize,
}

impl Default for TargetEnumerator {
    fn default() -> Self {
        Self {
            max_addresses: DEFAULT_MAX_ADDRESSES,
        }
    }
}

impl TargetEnumerator {
    pub fn new(max_addresses: usize) -> Self {
        Self { max_addresses }
    }

    /// Parse a single expression; a bare address is a host network
    pub fn parse_network(expression: &str) -> Result<IpNetwork> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ScanError::InvalidTarget("empty target expression".to_string()));
        }

        if !expression.contains('/') {
            let addr = IpAddr::from_str(expression)
                .map_err(|_| ScanError::InvalidTarget(format!("Invalid target format: {}", expression)))?;
            return Ok(IpNetwork::from(addr));
        }

        IpNetwork::from_str(expression)
            .map_err(|e| ScanError::InvalidTarget(format!("{}: {}", expression, e)))
    }

    /// Expand `expression` into the addresses to probe
    ///
    /// IPv4 networks with a prefix of 30 or shorter skip the network and broadcast
    /// addresses; /31 and /32 yield every address.
    pub fn enumerate(&self, expression: &str) -> Result<Vec<IpAddr>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for part in expression.split(',').filter(|p| !p.trim().is_empty()) {
            let network = Self::parse_network(part)?;
            let count = usable_count(&network);
            if count > self.max_addresses as u128 {
                return Err(ScanError::InvalidTarget(format!(
                    "{} expands to {} addresses (limit {})",
                    network, count, self.max_addresses
                )));
            }

            for addr in usable_hosts(network) {
                if seen.insert(addr) {
                    if targets.len() >= self.max_addresses {
                        return Err(ScanError::InvalidTarget(format!(
                            "{} expands past the {} address limit",
                            expression.trim(),
                            self.max_addresses
                        )));
                    }
                    targets.push(addr);
                }
            }
        }

        if targets.is_empty() {
            return Err(ScanError::InvalidTarget(format!(
                "{} contains no addresses",
                expression.trim()
            )));
        }

        log::debug!("Enumerated {} targets from {}", targets.len(), expression.trim());
        Ok(targets)
    }
}

fn usable_count(network: &IpNetwork) -> u128 {
    match network {
        IpNetwork::V4(net) => {
            let total = 1u128 << (32 - net.prefix() as u32);
            if net.prefix() <= 30 {
                total - 2
            } else {
                total
            }
        }
        IpNetwork::V6(net) => {
            let host_bits = 128 - net.prefix() as u32;
            if host_bits >= 128 {
                u128::MAX
            } else {
                1u128 << host_bits
            }
        }
    }
}

fn usable_hosts(network: IpNetwork) -> Box<dyn Iterator<Item = IpAddr>> {
    match network {
        IpNetwork::V4(net) => Box::new(usable_v4(net).map(IpAddr::V4)),
        IpNetwork::V6(net) => Box::new(usable_v6(net).map(IpAddr::V6)),
    }
}

fn usable_v4(net: Ipv4Network) -> impl Iterator<Item = std::net::Ipv4Addr> {
    let network_addr = net.network();
    let broadcast = net.broadcast();
    let trim_edges = net.prefix() <= 30;
    net.iter()
        .filter(move |addr| !trim_edges || (*addr != network_addr && *addr != broadcast))
}

fn usable_v6(net: Ipv6Network) -> impl Iterator<Item = std::net::Ipv6Addr> {
    net.iter()
}

/// Expand with the default address cap
pub fn enumerate_targets(expression: &str) -> Result<Vec<IpAddr>> {
    TargetEnumerator::default().enumerate(expression)
}
