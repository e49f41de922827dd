//! Error handling for the reconnaissance engine
//!
//! Two layers of errors exist. [`ScanError`] describes failures of a whole run and
//! is only ever returned before scanning begins (bad target, missing privilege,
//! invalid configuration). [`ProbeError`] describes the failure of a single probe;
//! the worker pool logs it and records the job as filtered.

use std::io;
use thiserror::Error;

/// Run-level error type
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Permission denied: {0}")]
    PermissionError(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Port range error: {0}")]
    PortRangeError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Fingerprinting failed: {0}")]
    FingerprintError(String),

    #[error("Output error: {0}")]
    OutputError(String),
}

impl ScanError {
    /// True for errors that can only happen before any probe is sent
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            ScanError::InvalidTarget(_)
                | ScanError::PermissionError(_)
                | ScanError::PortRangeError(_)
                | ScanError::ConfigError(_)
        )
    }
}

#[cfg(unix)]
const UNREACHABLE_ERRNOS: &[i32] = &[libc::ENETUNREACH, libc::EHOSTUNREACH];
#[cfg(not(unix))]
const UNREACHABLE_ERRNOS: &[i32] = &[];

/// Per-job probe failure
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported probe: {0}")]
    Unsupported(String),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ProbeError {
    /// Sort an I/O failure from a probe socket into the matching variant
    pub fn from_io(err: io::Error, target: &str) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(target.to_string()),
            io::ErrorKind::AddrNotAvailable => ProbeError::Unreachable(target.to_string()),
            _ => match err.raw_os_error() {
                Some(code) if UNREACHABLE_ERRNOS.contains(&code) => {
                    ProbeError::Unreachable(target.to_string())
                }
                _ => ProbeError::Io(err),
            },
        }
    }
}

/// Convert common errors to ScanError
impl From<std::net::AddrParseError> for ScanError {
    fn from(e: std::net::AddrParseError) -> Self {
        ScanError::InvalidTarget(e.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for ScanError {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        ScanError::InvalidTarget(e.to_string())
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(e: toml::de::Error) -> Self {
        ScanError::ConfigError(format!("Failed to parse TOML: {}", e))
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(e: serde_json::Error) -> Self {
        ScanError::OutputError(e.to_string())
    }
}
