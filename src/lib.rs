//! netrecon - concurrent network reconnaissance
//!
//! Discovers live hosts on a network, classifies their ports across TCP, UDP and
//! ICMP with a bounded worker pool, optionally fingerprints services and maps
//! reachability between the hosts it found.

pub mod config;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod network;
pub mod output;
pub mod scanner;
pub mod topology;
pub mod utils;

// Re-export commonly used types
pub use config::{DiscoveryMethod, ScanConfig};
pub use error::{ProbeError, ScanError};
pub use network::{PortResult, PortState, Protocol};
pub use output::{render, ReportFormat, ScanReport};
pub use scanner::engine::{run_scan, EngineState, ReconEngine};

pub type Result<T> = std::result::Result<T, ScanError>;
