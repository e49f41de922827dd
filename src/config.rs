//! Configuration module for the reconnaissance engine

use crate::network::stealth::EvasionThrottle;
use crate::network::Protocol;
use crate::utils::TargetEnumerator;
use crate::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-user config file in the home directory
pub const CONFIG_FILE_NAME: &str = ".netrecon.toml";

/// Upper bound on `worker_count`; each worker may hold one socket open
pub const MAX_WORKERS: usize = 4096;

/// How live hosts are found before port scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    /// Link-layer ARP broadcast; needs raw socket privilege
    Arp,
    /// TCP connect sweep over well-known ports; unprivileged
    Connect,
}

impl std::fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryMethod::Arp => write!(f, "arp"),
            DiscoveryMethod::Connect => write!(f, "connect"),
        }
    }
}

impl std::str::FromStr for DiscoveryMethod {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "arp" => Ok(DiscoveryMethod::Arp),
            "connect" | "tcp" => Ok(DiscoveryMethod::Connect),
            other => Err(ScanError::ConfigError(format!("Unknown discovery method: {}", other))),
        }
    }
}

/// Main configuration structure for a reconnaissance run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Network to scan, CIDR or bare address; comma-separated lists allowed
    pub target_network: String,

    /// Ports as `"start-end"` or a comma list such as `"22,80,8000-8010"`
    pub port_range: String,

    pub protocols: Vec<Protocol>,

    /// Number of concurrent probe workers
    pub worker_count: usize,

    /// Randomize job order and jitter every probe
    pub evasion: bool,

    pub probe_timeout_ms: u64,

    /// Window for collecting discovery replies
    pub discovery_timeout_ms: u64,

    pub discovery: DiscoveryMethod,

    /// Interface for ARP discovery; picked automatically when unset
    pub interface: Option<String>,

    pub evasion_min_delay_ms: u64,
    pub evasion_max_delay_ms: u64,

    /// Hand open TCP ports to the external service fingerprinter
    pub service_detection: bool,

    /// Also run vulnerability scripts during fingerprinting
    pub vuln_scan: bool,

    /// Per-host budget for the fingerprinting tool
    pub fingerprint_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            target_network: "192.168.1.0/24".to_string(),
            port_range: "1-1024".to_string(),
            protocols: vec![Protocol::Tcp],
            worker_count: 32,
            evasion: false,
            probe_timeout_ms: 1000,
            discovery_timeout_ms: 2000,
            discovery: DiscoveryMethod::Arp,
            interface: None,
            evasion_min_delay_ms: 10,
            evasion_max_delay_ms: 50,
            service_detection: true,
            vuln_scan: false,
            fingerprint_timeout_ms: 120_000,
        }
    }
}

impl ScanConfig {
    /// Create a new scan configuration
    pub fn new(target_network: impl Into<String>) -> Self {
        Self {
            target_network: target_network.into(),
            ..Default::default()
        }
    }

    pub fn with_ports(mut self, port_range: impl Into<String>) -> Self {
        self.port_range = port_range.into();
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_evasion(mut self, evasion: bool) -> Self {
        self.evasion = evasion;
        self
    }

    pub fn with_evasion_delays(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.evasion_min_delay_ms = min_ms;
        self.evasion_max_delay_ms = max_ms;
        self
    }

    pub fn with_probe_timeout(mut self, timeout_ms: u64) -> Self {
        self.probe_timeout_ms = timeout_ms;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryMethod) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout_ms: u64) -> Self {
        self.discovery_timeout_ms = timeout_ms;
        self
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_service_detection(mut self, enabled: bool) -> Self {
        self.service_detection = enabled;
        self
    }

    pub fn with_vuln_scan(mut self, vuln_scan: bool) -> Self {
        self.vuln_scan = vuln_scan;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn fingerprint_timeout(&self) -> Duration {
        Duration::from_millis(self.fingerprint_timeout_ms)
    }

    /// Parsed port list
    pub fn ports(&self) -> Result<Vec<u16>> {
        parse_port_spec(&self.port_range)
    }

    /// Throttle handed to each worker
    pub fn throttle(&self) -> EvasionThrottle {
        if self.evasion {
            EvasionThrottle::enabled(
                Duration::from_millis(self.evasion_min_delay_ms),
                Duration::from_millis(self.evasion_max_delay_ms),
            )
        } else {
            EvasionThrottle::disabled()
        }
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ScanError::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: ScanConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// `~/.netrecon.toml`, when a home directory is known
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_FILE_NAME))
    }

    /// Load `~/.netrecon.toml` if present, otherwise defaults
    pub fn load_default_config() -> Result<Self> {
        match Self::default_config_path() {
            Some(path) if path.exists() => {
                let config = Self::from_toml_file(&path)?;
                log::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.target_network.trim().is_empty() {
            return Err(ScanError::InvalidTarget("Target network cannot be empty".to_string()));
        }
        for part in self.target_network.split(',').filter(|p| !p.trim().is_empty()) {
            TargetEnumerator::parse_network(part)?;
        }

        if self.worker_count == 0 {
            return Err(ScanError::ConfigError("Worker count must be greater than 0".to_string()));
        }
        if self.worker_count > MAX_WORKERS {
            return Err(ScanError::ConfigError(format!(
                "Worker count {} exceeds the maximum of {}",
                self.worker_count, MAX_WORKERS
            )));
        }

        if self.protocols.is_empty() {
            return Err(ScanError::ConfigError("At least one protocol is required".to_string()));
        }

        if self.protocols.iter().any(|p| p.is_port_based()) {
            self.ports()?;
        }

        if self.probe_timeout_ms == 0 {
            return Err(ScanError::ConfigError("Probe timeout must be greater than 0".to_string()));
        }

        if self.discovery_timeout_ms == 0 {
            return Err(ScanError::ConfigError("Discovery timeout must be greater than 0".to_string()));
        }

        if self.evasion_min_delay_ms > self.evasion_max_delay_ms {
            return Err(ScanError::ConfigError(format!(
                "Evasion delay bounds inverted: min {}ms > max {}ms",
                self.evasion_min_delay_ms, self.evasion_max_delay_ms
            )));
        }

        Ok(())
    }
}

/// Parse `"1-1024"` or `"22,80,8000-8010"` into an order-stable, deduplicated list
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>> {
    let mut seen = HashSet::new();
    let mut ports = Vec::new();

    for part in spec.split(',').map(str::trim) {
        if part.is_empty() {
            continue;
        }

        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (parse_port(start)?, parse_port(end)?),
            None => {
                let port = parse_port(part)?;
                (port, port)
            }
        };

        if start > end {
            return Err(ScanError::PortRangeError(format!(
                "Range start {} is greater than end {}",
                start, end
            )));
        }

        for port in start..=end {
            if seen.insert(port) {
                ports.push(port);
            }
        }
    }

    if ports.is_empty() {
        return Err(ScanError::PortRangeError(format!("No ports in '{}'", spec)));
    }
    Ok(ports)
}

fn parse_port(value: &str) -> Result<u16> {
    let port: u16 = value
        .trim()
        .parse()
        .map_err(|_| ScanError::PortRangeError(format!("Invalid port: '{}'", value.trim())))?;
    if port == 0 {
        return Err(ScanError::PortRangeError("Port 0 is not scannable".to_string()));
    }
    Ok(port)
}
