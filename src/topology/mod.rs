//! Topology pass over discovered hosts
//!
//! For every ordered pair `(a, b)` of distinct hosts the prober checks whether `b`
//! is reachable and, if so, records `b` in `a`'s adjacency list. The scanner can
//! only originate traffic itself, so this measures reachability from the scanning
//! host and approximates true host-to-host adjacency.

use crate::network::icmp::{ping_host, IcmpPinger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

/// Ports tried by the TCP fallback when a peer has no known open ports
pub const DEFAULT_REACHABILITY_PORTS: &[u16] = &[22, 80, 443];

/// Single best-effort reachability check
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    fn name(&self) -> &str;

    /// `ports` are the peer's known open TCP ports, possibly empty
    async fn is_reachable(&self, target: IpAddr, ports: &[u16]) -> bool;
}

/// ICMP echo reachability
#[derive(Debug, Clone)]
pub struct IcmpReachability {
    timeout: Duration,
}

impl IcmpReachability {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReachabilityCheck for IcmpReachability {
    fn name(&self) -> &str {
        "icmp"
    }

    async fn is_reachable(&self, target: IpAddr, _ports: &[u16]) -> bool {
        match target {
            IpAddr::V4(v4) => {
                let result = ping_host(v4, self.timeout).await;
                if let Some(err) = &result.error {
                    log::trace!("{} unreachable: {}", target, err);
                }
                result.success
            }
            IpAddr::V6(_) => false,
        }
    }
}

/// TCP connect reachability; an accepted or refused connection both prove a route
#[derive(Debug, Clone)]
pub struct TcpReachability {
    timeout: Duration,
    default_ports: Vec<u16>,
}

impl TcpReachability {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            default_ports: DEFAULT_REACHABILITY_PORTS.to_vec(),
        }
    }

    pub fn with_default_ports(mut self, ports: Vec<u16>) -> Self {
        self.default_ports = ports;
        self
    }
}

#[async_trait]
impl ReachabilityCheck for TcpReachability {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn is_reachable(&self, target: IpAddr, ports: &[u16]) -> bool {
        let ports = if ports.is_empty() { &self.default_ports[..] } else { ports };
        for &port in ports {
            let attempt = tokio::time::timeout(self.timeout, TcpStream::connect(SocketAddr::new(target, port)));
            match attempt.await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => return true,
                _ => continue,
            }
        }
        false
    }
}

/// ICMP when an ICMP socket can be opened, otherwise TCP connect
pub fn select_reachability(timeout: Duration) -> Arc<dyn ReachabilityCheck> {
    match IcmpPinger::check_available() {
        Ok(()) => Arc::new(IcmpReachability::new(timeout)),
        Err(e) => {
            log::info!("ICMP unavailable for topology ({}), using TCP connect checks", e);
            Arc::new(TcpReachability::new(timeout))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub from: IpAddr,
    pub to: IpAddr,
}

/// Adjacency list `host -> reachable peers`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub adjacency: BTreeMap<IpAddr, Vec<IpAddr>>,
}

impl Topology {
    pub fn is_empty(&self) -> bool {
        self.adjacency.values().all(|peers| peers.is_empty())
    }

    pub fn neighbors(&self, host: IpAddr) -> &[IpAddr] {
        self.adjacency.get(&host).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn edges(&self) -> Vec<TopologyEdge> {
        self.adjacency
            .iter()
            .flat_map(|(from, peers)| peers.iter().map(move |to| TopologyEdge { from: *from, to: *to }))
            .collect()
    }
}

/// Runs the pairwise pass with bounded concurrency
pub struct TopologyProber {
    check: Arc<dyn ReachabilityCheck>,
    concurrency: usize,
}

impl TopologyProber {
    pub fn new(check: Arc<dyn ReachabilityCheck>, concurrency: usize) -> Self {
        Self {
            check,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn probe(&self, hosts: &[IpAddr], open_ports: &HashMap<IpAddr, Vec<u16>>) -> Topology {
        let mut adjacency: BTreeMap<IpAddr, Vec<IpAddr>> = hosts.iter().map(|h| (*h, Vec::new())).collect();
        if hosts.len() < 2 {
            return Topology { adjacency };
        }

        log::info!(
            "Probing {} host pairs with {} reachability checks",
            hosts.len() * (hosts.len() - 1),
            self.check.name()
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::new();
        for &from in hosts {
            for &to in hosts.iter().filter(|&&to| to != from) {
                let semaphore = semaphore.clone();
                let check = self.check.clone();
                let ports = open_ports.get(&to).cloned().unwrap_or_default();
                tasks.push(tokio::spawn(async move {
                    let reachable = match semaphore.acquire_owned().await {
                        Ok(_permit) => check.is_reachable(to, &ports).await,
                        Err(_) => false,
                    };
                    (from, to, reachable)
                }));
            }
        }

        for outcome in futures::future::join_all(tasks).await {
            match outcome {
                Ok((from, to, true)) => {
                    if let Some(peers) = adjacency.get_mut(&from) {
                        peers.push(to);
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Topology probe task failed: {}", e),
            }
        }

        let order: HashMap<IpAddr, usize> = hosts.iter().enumerate().map(|(i, h)| (*h, i)).collect();
        for peers in adjacency.values_mut() {
            peers.sort_by_key(|p| order.get(p).copied().unwrap_or(usize::MAX));
        }
        Topology { adjacency }
    }
}
