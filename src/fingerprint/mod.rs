//! Boundary to an external service/vulnerability fingerprinting tool
//!
//! Fingerprinting is slow and may fail. Each host runs under its own timeout and
//! a failure only removes that host's services and findings from the report.

pub mod nmap;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub use nmap::NmapFingerprinter;

/// Services and findings for one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// port -> "name product version"
    pub services: BTreeMap<u16, String>,
    /// port -> finding ids (script ids, CVE ids)
    pub findings: BTreeMap<u16, Vec<String>>,
}

impl Fingerprint {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.findings.is_empty()
    }
}

#[async_trait]
pub trait ServiceFingerprinter: Send + Sync {
    fn name(&self) -> &str;

    async fn fingerprint(&self, host: IpAddr, open_tcp_ports: &[u16]) -> Result<Fingerprint>;
}

/// Fingerprint every host concurrently; hosts that fail or time out are omitted
pub async fn fingerprint_hosts(
    fingerprinter: Arc<dyn ServiceFingerprinter>,
    targets: Vec<(IpAddr, Vec<u16>)>,
    per_host_timeout: Duration,
) -> BTreeMap<IpAddr, Fingerprint> {
    let tasks = targets
        .into_iter()
        .filter(|(_, ports)| !ports.is_empty())
        .map(|(host, ports)| {
            let fingerprinter = fingerprinter.clone();
            tokio::spawn(async move {
                let outcome = tokio::time::timeout(per_host_timeout, fingerprinter.fingerprint(host, &ports)).await;
                (host, outcome)
            })
        });

    let mut fingerprints = BTreeMap::new();
    for joined in futures::future::join_all(tasks).await {
        match joined {
            Ok((host, Ok(Ok(fingerprint)))) => {
                fingerprints.insert(host, fingerprint);
            }
            Ok((host, Ok(Err(e)))) => log::warn!("Fingerprinting {} failed: {}", host, e),
            Ok((host, Err(_))) => log::warn!("Fingerprinting {} timed out after {:?}", host, per_host_timeout),
            Err(e) => log::warn!("Fingerprint task failed: {}", e),
        }
    }
    fingerprints
}
