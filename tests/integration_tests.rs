//! End-to-end runs of the reconnaissance engine against localhost fixtures

use async_trait::async_trait;
use netrecon::{
    config::ScanConfig,
    discovery::{Host, HostDiscovery},
    fingerprint::{Fingerprint, ServiceFingerprinter},
    network::{PortState, Protocol},
    topology::ReachabilityCheck,
    utils::enumerate_targets,
    EngineState, ReconEngine,
};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Reports every targeted address in `alive` as up
struct FixtureDiscovery {
    alive: HashSet<IpAddr>,
    delay: Duration,
}

impl FixtureDiscovery {
    fn new(alive: &[IpAddr]) -> Arc<Self> {
        Arc::new(Self {
            alive: alive.iter().copied().collect(),
            delay: Duration::ZERO,
        })
    }

    fn slow(alive: &[IpAddr], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            alive: alive.iter().copied().collect(),
            delay,
        })
    }
}

#[async_trait]
impl HostDiscovery for FixtureDiscovery {
    fn method_name(&self) -> &str {
        "fixture"
    }

    fn check_privileges(&self, _targets: &[IpAddr]) -> netrecon::Result<()> {
        Ok(())
    }

    async fn discover(&self, targets: &[IpAddr], _timeout: Duration) -> netrecon::Result<Vec<Host>> {
        tokio::time::sleep(self.delay).await;
        Ok(targets
            .iter()
            .filter(|t| self.alive.contains(t))
            .map(|t| Host::new(*t, None))
            .collect())
    }
}

struct AlwaysReachable;

#[async_trait]
impl ReachabilityCheck for AlwaysReachable {
    fn name(&self) -> &str {
        "always"
    }

    async fn is_reachable(&self, _target: IpAddr, _ports: &[u16]) -> bool {
        true
    }
}

struct BannerFingerprinter;

#[async_trait]
impl ServiceFingerprinter for BannerFingerprinter {
    fn name(&self) -> &str {
        "banner"
    }

    async fn fingerprint(&self, _host: IpAddr, open_tcp_ports: &[u16]) -> netrecon::Result<Fingerprint> {
        let mut fp = Fingerprint::default();
        for port in open_tcp_ports {
            fp.services.insert(*port, "fixture-service 1.0".to_string());
        }
        Ok(fp)
    }
}

fn localhost() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Port nothing listens on: bind, note the port, release it
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn engine(config: ScanConfig, alive: &[IpAddr]) -> ReconEngine {
    ReconEngine::new(config.with_service_detection(false))
        .with_discovery(FixtureDiscovery::new(alive))
        .with_reachability(Arc::new(AlwaysReachable))
}

#[tokio::test]
async fn test_listening_and_silent_port_on_one_host() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let closed = closed_port().await;

    let config = ScanConfig::new("127.0.0.1")
        .with_ports(format!("{},{}", open, closed))
        .with_workers(2)
        .with_probe_timeout(500);
    let engine = engine(config, &[localhost()]);

    let report = engine.run().await.unwrap();

    assert_eq!(engine.state(), EngineState::Done);
    assert_eq!(report.hosts.len(), 1);
    assert_eq!(report.port_state(localhost(), open, Protocol::Tcp), Some(PortState::Open));
    let other = report.port_state(localhost(), closed, Protocol::Tcp).unwrap();
    assert!(matches!(other, PortState::Closed | PortState::Filtered));
    assert_eq!(report.host(localhost()).unwrap().open_ports.len(), 1);
    assert!(!report.cancelled);
}

#[tokio::test]
async fn test_unreachable_host_yields_empty_report() {
    let config = ScanConfig::new("192.0.2.1").with_ports("80");
    let engine = engine(config, &[]);

    let report = engine.run().await.unwrap();

    assert_eq!(engine.state(), EngineState::Done);
    assert!(report.hosts.is_empty());
    assert!(report.topology_edges.is_empty());
    assert_eq!(report.stats.probes, 0);
}

#[tokio::test]
async fn test_every_job_is_classified_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let ports = vec![open, closed_port().await, closed_port().await];
    let spec = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");

    let config = ScanConfig::new("127.0.0.1")
        .with_ports(spec)
        .with_protocols(vec![Protocol::Tcp, Protocol::Udp])
        .with_workers(4)
        .with_probe_timeout(300);
    let report = engine(config, &[localhost()]).run().await.unwrap();

    let host = report.host(localhost()).unwrap();
    assert_eq!(host.ports.len(), ports.len() * 2);
    assert_eq!(report.stats.probes as usize, ports.len() * 2);
    assert_eq!(report.stats.duplicates, 0);
    for port in &ports {
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            assert!(report.port_state(localhost(), *port, protocol).is_some());
        }
    }
}

#[tokio::test]
async fn test_worker_count_does_not_change_results() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let mut ports = vec![open];
    for _ in 0..5 {
        ports.push(closed_port().await);
    }
    let spec = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");

    let mut classifications = Vec::new();
    for workers in [1, 8, 64] {
        let config = ScanConfig::new("127.0.0.1")
            .with_ports(spec.clone())
            .with_workers(workers)
            .with_probe_timeout(500);
        let report = engine(config, &[localhost()]).run().await.unwrap();
        let states: Vec<(u16, PortState)> = report
            .host(localhost())
            .unwrap()
            .ports
            .iter()
            .map(|p| (p.port, p.state))
            .collect();
        classifications.push(states);
    }

    assert_eq!(classifications[0], classifications[1]);
    assert_eq!(classifications[1], classifications[2]);
}

#[tokio::test]
async fn test_evasion_changes_timing_not_results() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let mut ports = vec![open];
    for _ in 0..3 {
        ports.push(closed_port().await);
    }
    let spec = ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
    let base = ScanConfig::new("127.0.0.1")
        .with_ports(spec)
        .with_workers(1)
        .with_probe_timeout(500)
        .with_evasion_delays(30, 40);

    let started = Instant::now();
    let plain = engine(base.clone(), &[localhost()]).run().await.unwrap();
    let plain_elapsed = started.elapsed();

    let started = Instant::now();
    let evasive = engine(base.with_evasion(true), &[localhost()]).run().await.unwrap();
    let evasive_elapsed = started.elapsed();

    let states = |r: &netrecon::ScanReport| -> Vec<(u16, PortState)> {
        r.host(localhost()).unwrap().ports.iter().map(|p| (p.port, p.state)).collect()
    };
    assert_eq!(states(&plain), states(&evasive));
    // Four jobs, one worker, at least 30ms before each
    assert!(evasive_elapsed >= Duration::from_millis(120));
    assert!(evasive_elapsed >= plain_elapsed);
}

#[tokio::test]
async fn test_enumeration_is_idempotent() {
    let expected: Vec<IpAddr> = vec!["192.168.1.1".parse().unwrap(), "192.168.1.2".parse().unwrap()];
    for _ in 0..3 {
        assert_eq!(enumerate_targets("192.168.1.0/30").unwrap(), expected);
    }
}

#[tokio::test]
async fn test_topology_connects_discovered_hosts() {
    let other: IpAddr = "127.0.0.2".parse().unwrap();
    let config = ScanConfig::new("127.0.0.1,127.0.0.2")
        .with_ports(closed_port().await.to_string())
        .with_probe_timeout(300);
    let report = engine(config, &[localhost(), other]).run().await.unwrap();

    assert_eq!(report.hosts.len(), 2);
    assert_eq!(report.topology.neighbors(localhost()), &[other]);
    assert_eq!(report.topology.neighbors(other), &[localhost()]);
    assert_eq!(report.topology_edges.len(), 2);
}

#[tokio::test]
async fn test_fingerprints_attach_to_open_ports() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let config = ScanConfig::new("127.0.0.1")
        .with_ports(format!("{},{}", open, closed_port().await))
        .with_probe_timeout(300);
    let engine = engine(config, &[localhost()]).with_fingerprinter(Some(Arc::new(BannerFingerprinter)));

    let report = engine.run().await.unwrap();

    let host = report.host(localhost()).unwrap();
    assert_eq!(host.services.len(), 1);
    assert_eq!(host.services.get(&open).map(String::as_str), Some("fixture-service 1.0"));
}

#[tokio::test]
async fn test_cancelled_run_still_reports() {
    let config = ScanConfig::new("127.0.0.1").with_ports("1-50").with_workers(4);
    let engine = engine(config, &[localhost()]);
    engine.cancel_token().cancel();

    let report = engine.run().await.unwrap();

    assert!(report.cancelled);
    assert_eq!(engine.state(), EngineState::Done);
    // Discovery still ran, but no worker took a job
    assert_eq!(report.hosts.len(), 1);
    assert!(report.host(localhost()).unwrap().ports.is_empty());
    assert!(report.topology.is_empty());
}

#[tokio::test]
async fn test_states_only_move_forward() {
    let config = ScanConfig::new("127.0.0.1")
        .with_ports(closed_port().await.to_string())
        .with_service_detection(false);
    let engine = Arc::new(
        ReconEngine::new(config)
            .with_discovery(FixtureDiscovery::slow(&[localhost()], Duration::from_millis(100)))
            .with_reachability(Arc::new(AlwaysReachable)),
    );

    let watcher = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut seen = vec![engine.state()];
            while !engine.state().is_terminal() {
                let state = engine.state();
                if seen.last() != Some(&state) {
                    seen.push(state);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            seen.push(engine.state());
            seen
        })
    };

    engine.run().await.unwrap();
    let seen = watcher.await.unwrap();

    assert!(seen.contains(&EngineState::Discovering));
    assert_eq!(seen.last(), Some(&EngineState::Done));
    assert!(!seen.contains(&EngineState::Failed));
    let order: Vec<u8> = seen.iter().map(|s| *s as u8).collect();
    assert!(order.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_json_report_round_trips() {
    let config = ScanConfig::new("127.0.0.1").with_ports(closed_port().await.to_string());
    let report = engine(config, &[localhost()]).run().await.unwrap();

    let json = netrecon::render(&report, netrecon::ReportFormat::Json).unwrap();
    let parsed: netrecon::ScanReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.hosts.len(), 1);
    assert_eq!(parsed.scan_config, report.scan_config);
}
