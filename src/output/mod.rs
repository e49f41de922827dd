//! Report model and rendering
//!
//! Rendering is a pure function of [`ScanReport`]; writing the result anywhere is
//! up to the caller.

use crate::config::ScanConfig;
use crate::discovery::{mac_serde, Host};
use crate::fingerprint::Fingerprint;
use crate::network::{duration_millis, PortResult, PortState, Protocol};
use crate::scanner::{ScanResults, ScanStats};
use crate::topology::{Topology, TopologyEdge};
use crate::{Result, ScanError};
use chrono::{DateTime, Utc};
use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::Duration;

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Text,
    Json,
}

impl std::str::FromStr for ReportFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "txt" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            other => Err(ScanError::ConfigError(format!("Unknown report format: {}", other))),
        }
    }
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportFormat::Text => write!(f, "text"),
            ReportFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for OpenPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Everything known about one discovered host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReport {
    pub address: IpAddr,
    #[serde(with = "mac_serde", default)]
    pub link_layer_id: Option<MacAddr>,
    pub discovered_at: DateTime<Utc>,
    /// Every classified job for this host, ordered by port then protocol
    pub ports: Vec<PortResult>,
    pub open_ports: Vec<OpenPort>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub services: BTreeMap<u16, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub findings: BTreeMap<u16, Vec<String>>,
}

impl HostReport {
    fn count(&self, state: PortState) -> usize {
        self.ports.iter().filter(|p| p.state == state).count()
    }
}

/// Final, read-only result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub target_network: String,
    pub scan_config: ScanConfig,
    pub hosts: Vec<HostReport>,
    pub topology: Topology,
    pub topology_edges: Vec<TopologyEdge>,
    pub stats: ScanStats,
    /// The run was stopped early; results are partial
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ScanReport {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: &ScanConfig,
        hosts: &[Host],
        results: &ScanResults,
        mut fingerprints: BTreeMap<IpAddr, Fingerprint>,
        topology: Topology,
        started_at: DateTime<Utc>,
        duration: Duration,
        cancelled: bool,
    ) -> Self {
        let hosts = hosts
            .iter()
            .map(|host| {
                let mut ports = results.for_host(host.address);
                ports.sort_by_key(|p| (p.port, p.protocol));
                let open_ports = ports
                    .iter()
                    .filter(|p| p.state == PortState::Open)
                    .map(|p| OpenPort {
                        port: p.port,
                        protocol: p.protocol,
                    })
                    .collect();
                let fingerprint = fingerprints.remove(&host.address).unwrap_or_default();
                HostReport {
                    address: host.address,
                    link_layer_id: host.link_layer_id,
                    discovered_at: host.discovered_at,
                    ports,
                    open_ports,
                    services: fingerprint.services,
                    findings: fingerprint.findings,
                }
            })
            .collect();

        Self {
            target_network: config.target_network.clone(),
            scan_config: config.clone(),
            hosts,
            topology_edges: topology.edges(),
            topology,
            stats: results.stats().clone(),
            cancelled,
            started_at,
            duration,
        }
    }

    pub fn host(&self, address: IpAddr) -> Option<&HostReport> {
        self.hosts.iter().find(|h| h.address == address)
    }

    pub fn port_state(&self, address: IpAddr, port: u16, protocol: Protocol) -> Option<PortState> {
        self.host(address)?
            .ports
            .iter()
            .find(|p| p.port == port && p.protocol == protocol)
            .map(|p| p.state)
    }

    pub fn open_ports_by_host(&self) -> BTreeMap<IpAddr, Vec<OpenPort>> {
        self.hosts
            .iter()
            .map(|h| (h.address, h.open_ports.clone()))
            .collect()
    }
}

pub fn render(report: &ScanReport, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Text => Ok(render_text(report)),
        ReportFormat::Json => render_json(report),
    }
}

pub fn render_json(report: &ScanReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}

pub fn render_text(report: &ScanReport) -> String {
    let config = &report.scan_config;
    let mut out = String::new();

    let _ = writeln!(out, "Network Scan Report");
    let _ = writeln!(out, "===================");
    let _ = writeln!(out, "Target Network: {}", report.target_network);
    let _ = writeln!(out, "Started: {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "Duration: {:.2}s", report.duration.as_secs_f64());
    if report.cancelled {
        let _ = writeln!(out, "Status: cancelled, results are partial");
    }

    let protocols: Vec<&str> = config.protocols.iter().map(|p| p.as_str()).collect();
    let _ = writeln!(out, "Scan Type: {}", protocols.join(", "));
    let _ = writeln!(out, "Port Range: {}", config.port_range);
    let _ = writeln!(out, "Workers: {}", config.worker_count);
    let _ = writeln!(out, "Probe Timeout: {}ms", config.probe_timeout_ms);
    let _ = writeln!(out, "Discovery: {}", config.discovery);
    if config.evasion {
        let _ = writeln!(
            out,
            "IDS Evasion: Enabled ({}-{}ms jitter)",
            config.evasion_min_delay_ms, config.evasion_max_delay_ms
        );
    } else {
        let _ = writeln!(out, "IDS Evasion: Disabled");
    }
    let _ = writeln!(out, "Vulnerability Scan: {}", enabled(config.vuln_scan));
    out.push('\n');

    let _ = writeln!(out, "Active Hosts ({}):", report.hosts.len());
    if report.hosts.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for host in &report.hosts {
        match host.link_layer_id {
            Some(mac) => {
                let _ = writeln!(out, "  Host: {} ({})", host.address, mac);
            }
            None => {
                let _ = writeln!(out, "  Host: {}", host.address);
            }
        }

        if host.open_ports.is_empty() {
            let _ = writeln!(out, "    Open Ports: none");
        } else {
            let open: Vec<String> = host.open_ports.iter().map(|p| p.to_string()).collect();
            let _ = writeln!(out, "    Open Ports: {}", open.join(", "));
        }
        let _ = writeln!(
            out,
            "    Closed: {}  Filtered: {}",
            host.count(PortState::Closed),
            host.count(PortState::Filtered)
        );

        if !host.services.is_empty() {
            let _ = writeln!(out, "    Services:");
            for (port, service) in &host.services {
                let _ = writeln!(out, "      {}: {}", port, service);
            }
        }
        if !host.findings.is_empty() {
            let _ = writeln!(out, "    Vulnerabilities:");
            for (port, ids) in &host.findings {
                let _ = writeln!(out, "      {}: {}", port, ids.join(", "));
            }
        }
    }
    out.push('\n');

    let _ = writeln!(out, "Topology ({} edges):", report.topology_edges.len());
    if report.topology_edges.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for edge in &report.topology_edges {
        let _ = writeln!(out, "  {} -> {}", edge.from, edge.to);
    }
    out.push('\n');

    let stats = &report.stats;
    let _ = writeln!(
        out,
        "Statistics: {} probes, {} open, {} closed, {} filtered, {} errors",
        stats.probes, stats.open, stats.closed, stats.filtered, stats.probe_errors
    );
    if stats.probes > 0 {
        let _ = writeln!(
            out,
            "Response time: min {}ms / avg {}ms / max {}ms",
            stats.min_response_time.as_millis(),
            stats.avg_response_time.as_millis(),
            stats.max_response_time.as_millis()
        );
    }
    out
}
