//! Scanner module: job generation, the job queue, worker pool, aggregation and
//! the engine that drives a whole run

pub mod aggregator;
pub mod engine;
pub mod pool;
pub mod queue;

use crate::network::Protocol;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub use aggregator::{ResultAggregator, ResultSink, ScanResults, ScanStats};
pub use engine::{EngineState, ReconEngine};
pub use pool::WorkerPool;
pub use queue::{JobQueue, QueueFull};

/// One unit of work: classify `port` on `host` for `protocol`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanJob {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl ScanJob {
    pub fn new(host: IpAddr, port: u16, protocol: Protocol) -> Self {
        Self { host, port, protocol }
    }

    /// ICMP host check, recorded under pseudo-port 0
    pub fn icmp(host: IpAddr) -> Self {
        Self::new(host, 0, Protocol::Icmp)
    }

    pub fn key(&self) -> (IpAddr, u16, Protocol) {
        (self.host, self.port, self.protocol)
    }
}

/// Cartesian product of hosts, ports and port-based protocols, host-major and
/// port-minor, plus one ICMP job per host when ICMP is requested
pub fn build_jobs(hosts: &[IpAddr], ports: &[u16], protocols: &[Protocol]) -> Vec<ScanJob> {
    let mut port_protocols: Vec<Protocol> = Vec::new();
    for protocol in protocols.iter().filter(|p| p.is_port_based()) {
        if !port_protocols.contains(protocol) {
            port_protocols.push(*protocol);
        }
    }
    let wants_icmp = protocols.contains(&Protocol::Icmp);

    let per_host = ports.len() * port_protocols.len() + usize::from(wants_icmp);
    let mut jobs = Vec::with_capacity(hosts.len() * per_host);

    for &host in hosts {
        if wants_icmp {
            jobs.push(ScanJob::icmp(host));
        }
        for &port in ports {
            for &protocol in &port_protocols {
                jobs.push(ScanJob::new(host, port, protocol));
            }
        }
    }
    jobs
}
