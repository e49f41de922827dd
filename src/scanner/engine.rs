//! Reconnaissance engine driving one run end to end
//!
//! `Configured -> Discovering -> Scanning -> Aggregating -> Topology -> Reporting
//! -> Done`. Only pre-flight checks in `Configured` can fail a run; every later
//! stage degrades to thinner results instead.

use super::aggregator::ResultAggregator;
use super::pool::WorkerPool;
use super::queue::JobQueue;
use super::{build_jobs, ScanResults};
use crate::config::ScanConfig;
use crate::discovery::{self, Host, HostDiscovery};
use crate::fingerprint::{fingerprint_hosts, Fingerprint, NmapFingerprinter, ServiceFingerprinter};
use crate::network::icmp::IcmpPinger;
use crate::network::{ProbeSet, Protocol};
use crate::output::ScanReport;
use crate::topology::{select_reachability, ReachabilityCheck, Topology, TopologyProber};
use crate::utils::TargetEnumerator;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EngineState {
    Configured = 0,
    Discovering = 1,
    Scanning = 2,
    Aggregating = 3,
    Topology = 4,
    Reporting = 5,
    Done = 6,
    Failed = 7,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Configured,
            1 => EngineState::Discovering,
            2 => EngineState::Scanning,
            3 => EngineState::Aggregating,
            4 => EngineState::Topology,
            5 => EngineState::Reporting,
            6 => EngineState::Done,
            _ => EngineState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Done | EngineState::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Configured => "CONFIGURED",
            EngineState::Discovering => "DISCOVERING",
            EngineState::Scanning => "SCANNING",
            EngineState::Aggregating => "AGGREGATING",
            EngineState::Topology => "TOPOLOGY",
            EngineState::Reporting => "REPORTING",
            EngineState::Done => "DONE",
            EngineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Everything validated before the first packet leaves
struct Preflight {
    targets: Vec<IpAddr>,
    ports: Vec<u16>,
}

/// Main reconnaissance engine
pub struct ReconEngine {
    config: ScanConfig,
    discovery: Arc<dyn HostDiscovery>,
    reachability: Option<Arc<dyn ReachabilityCheck>>,
    fingerprinter: Option<Arc<dyn ServiceFingerprinter>>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

impl ReconEngine {
    /// Engine with the discovery method and fingerprinter the config asks for
    pub fn new(config: ScanConfig) -> Self {
        let discovery = discovery::for_config(&config);
        let fingerprinter: Option<Arc<dyn ServiceFingerprinter>> = if config.service_detection {
            Some(Arc::new(NmapFingerprinter::new(config.vuln_scan)))
        } else {
            None
        };

        Self {
            config,
            discovery,
            reachability: None,
            fingerprinter,
            state: Arc::new(AtomicU8::new(EngineState::Configured as u8)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn HostDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Fix the topology check instead of picking ICMP or TCP at run time
    pub fn with_reachability(mut self, reachability: Arc<dyn ReachabilityCheck>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Option<Arc<dyn ServiceFingerprinter>>) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Token that stops the run between jobs; a stopped run still reports
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn transition(&self, next: EngineState) {
        let previous = EngineState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        log::info!("Engine {} -> {}", previous, next);
    }

    /// Run the whole pipeline
    pub async fn run(&self) -> Result<ScanReport> {
        self.state.store(EngineState::Configured as u8, Ordering::SeqCst);
        let started_at = Utc::now();
        let clock = Instant::now();

        let preflight = match self.preflight() {
            Ok(preflight) => preflight,
            Err(e) => {
                log::error!("Pre-flight check failed: {}", e);
                self.transition(EngineState::Failed);
                return Err(e);
            }
        };

        self.transition(EngineState::Discovering);
        let hosts = self.discover(&preflight.targets).await;

        self.transition(EngineState::Scanning);
        let addresses: Vec<IpAddr> = hosts.iter().map(|h| h.address).collect();
        let (aggregator, processed) = self.scan(&addresses, &preflight.ports).await;

        self.transition(EngineState::Aggregating);
        let results = aggregator.finish().await;
        if results.len() + results.stats().duplicates as usize != processed {
            log::warn!("{} jobs processed but {} results aggregated", processed, results.len());
        }
        let fingerprints = self.fingerprint(&addresses, &results).await;

        self.transition(EngineState::Topology);
        let topology = self.map_topology(&addresses, &results).await;

        self.transition(EngineState::Reporting);
        let report = ScanReport::build(
            &self.config,
            &hosts,
            &results,
            fingerprints,
            topology,
            started_at,
            clock.elapsed(),
            self.cancel.is_cancelled(),
        );

        self.transition(EngineState::Done);
        log::info!(
            "Run finished in {:.2}s: {} hosts, {} open ports",
            report.duration.as_secs_f64(),
            report.hosts.len(),
            report.stats.open
        );
        Ok(report)
    }

    fn preflight(&self) -> Result<Preflight> {
        self.config.validate()?;

        let targets = TargetEnumerator::default().enumerate(&self.config.target_network)?;
        let ports = if self.config.protocols.iter().any(|p| p.is_port_based()) {
            self.config.ports()?
        } else {
            Vec::new()
        };

        self.discovery.check_privileges(&targets)?;
        if self.config.protocols.contains(&Protocol::Icmp) {
            IcmpPinger::check_available()?;
        }

        log::info!(
            "{} targets, {} ports, protocols {:?}, {} workers, discovery {}",
            targets.len(),
            ports.len(),
            self.config.protocols,
            self.config.worker_count,
            self.discovery.method_name()
        );
        Ok(Preflight { targets, ports })
    }

    async fn discover(&self, targets: &[IpAddr]) -> Vec<Host> {
        match self
            .discovery
            .discover(targets, self.config.discovery_timeout())
            .await
        {
            Ok(hosts) => {
                log::info!("Discovered {} live hosts", hosts.len());
                hosts
            }
            Err(e) => {
                log::warn!("Discovery failed, continuing with no hosts: {}", e);
                Vec::new()
            }
        }
    }

    async fn scan(&self, hosts: &[IpAddr], ports: &[u16]) -> (ResultAggregator, usize) {
        let mut jobs = build_jobs(hosts, ports, &self.config.protocols);
        let throttle = self.config.throttle();
        throttle.arrange(&mut jobs);
        let total = jobs.len();
        log::info!("Queued {} scan jobs", total);

        let queue = Arc::new(JobQueue::from_jobs(jobs).await);
        let (aggregator, sink) = ResultAggregator::spawn(self.config.worker_count.saturating_mul(4));
        let pool = WorkerPool::new(
            self.config.worker_count,
            ProbeSet::new(&self.config.protocols, self.config.probe_timeout()),
            throttle,
            self.cancel.clone(),
        );

        let processed = pool.run(queue, sink).await;
        if processed < total {
            log::info!("{} of {} jobs left unprocessed", total - processed, total);
        }
        (aggregator, processed)
    }

    async fn fingerprint(&self, hosts: &[IpAddr], results: &ScanResults) -> BTreeMap<IpAddr, Fingerprint> {
        let Some(fingerprinter) = self.fingerprinter.clone() else {
            return BTreeMap::new();
        };
        if self.cancel.is_cancelled() {
            log::info!("Run cancelled, skipping fingerprinting");
            return BTreeMap::new();
        }

        let targets: Vec<(IpAddr, Vec<u16>)> = hosts
            .iter()
            .map(|h| (*h, results.open_tcp_ports(*h)))
            .filter(|(_, ports)| !ports.is_empty())
            .collect();
        if targets.is_empty() {
            return BTreeMap::new();
        }

        log::info!("Fingerprinting {} hosts with {}", targets.len(), fingerprinter.name());
        fingerprint_hosts(fingerprinter, targets, self.config.fingerprint_timeout()).await
    }

    async fn map_topology(&self, hosts: &[IpAddr], results: &ScanResults) -> Topology {
        if self.cancel.is_cancelled() {
            log::info!("Run cancelled, skipping topology");
            return Topology {
                adjacency: hosts.iter().map(|h| (*h, Vec::new())).collect(),
            };
        }

        let check = match &self.reachability {
            Some(check) => check.clone(),
            None => select_reachability(self.config.probe_timeout()),
        };
        let open_ports: HashMap<IpAddr, Vec<u16>> =
            hosts.iter().map(|h| (*h, results.open_tcp_ports(*h))).collect();

        TopologyProber::new(check, self.config.worker_count)
            .probe(hosts, &open_ports)
            .await
    }
}

/// Convenience wrapper: build an engine from `config` and run it
pub async fn run_scan(config: ScanConfig) -> Result<ScanReport> {
    ReconEngine::new(config).run().await
}
