//! Pre-flight failures and per-job error handling

use async_trait::async_trait;
use netrecon::{
    config::{DiscoveryMethod, ScanConfig},
    discovery::{Host, HostDiscovery},
    network::{stealth::EvasionThrottle, PortState, ProbeSet, Protocol},
    scanner::{engine::ReconEngine, JobQueue, ResultAggregator, ScanJob, WorkerPool},
    EngineState, ScanError,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Discovery that refuses to run without privileges and records whether it was used
#[derive(Default)]
struct Unprivileged {
    discovered: AtomicBool,
}

#[async_trait]
impl HostDiscovery for Unprivileged {
    fn method_name(&self) -> &str {
        "unprivileged"
    }

    fn check_privileges(&self, _targets: &[IpAddr]) -> netrecon::Result<()> {
        Err(ScanError::PermissionError("raw link-layer access denied".to_string()))
    }

    async fn discover(&self, _targets: &[IpAddr], _timeout: Duration) -> netrecon::Result<Vec<Host>> {
        self.discovered.store(true, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Discovery whose bulk operation fails after pre-flight passed
struct BrokenLink;

#[async_trait]
impl HostDiscovery for BrokenLink {
    fn method_name(&self) -> &str {
        "broken"
    }

    fn check_privileges(&self, _targets: &[IpAddr]) -> netrecon::Result<()> {
        Ok(())
    }

    async fn discover(&self, _targets: &[IpAddr], _timeout: Duration) -> netrecon::Result<Vec<Host>> {
        Err(ScanError::NetworkError("interface went down".to_string()))
    }
}

async fn run_failing(config: ScanConfig) -> (ScanError, EngineState) {
    let engine = ReconEngine::new(config.with_service_detection(false))
        .with_discovery(Arc::new(BrokenLink));
    let err = engine.run().await.unwrap_err();
    (err, engine.state())
}

#[tokio::test]
async fn test_invalid_target_fails_preflight() {
    let (err, state) = run_failing(ScanConfig::new("not-a-network")).await;
    assert!(matches!(err, ScanError::InvalidTarget(_)));
    assert_eq!(state, EngineState::Failed);

    let (err, _) = run_failing(ScanConfig::new("")).await;
    assert!(matches!(err, ScanError::InvalidTarget(_)));
}

#[tokio::test]
async fn test_zero_workers_fails_preflight() {
    let (err, state) = run_failing(ScanConfig::new("127.0.0.1").with_workers(0)).await;
    assert!(matches!(err, ScanError::ConfigError(_)));
    assert_eq!(state, EngineState::Failed);
}

#[tokio::test]
async fn test_oversized_worker_count_fails_preflight() {
    for workers in [netrecon::config::MAX_WORKERS + 1, usize::MAX / 2, usize::MAX] {
        let (err, state) = run_failing(ScanConfig::new("127.0.0.1").with_ports("1").with_workers(workers)).await;
        assert!(matches!(err, ScanError::ConfigError(_)), "{} gave {:?}", workers, err);
        assert_eq!(state, EngineState::Failed);
    }
}

#[tokio::test]
async fn test_bad_port_range_fails_preflight() {
    for spec in ["0-10", "100-10", "http", "70000"] {
        let (err, state) = run_failing(ScanConfig::new("127.0.0.1").with_ports(spec)).await;
        assert!(matches!(err, ScanError::PortRangeError(_)), "{} gave {:?}", spec, err);
        assert_eq!(state, EngineState::Failed);
    }
}

#[tokio::test]
async fn test_port_range_ignored_for_icmp_only() {
    // No port-based protocol, so the port spec is never parsed; the run gets
    // past pre-flight only if ICMP sockets are available here
    let config = ScanConfig::new("127.0.0.1")
        .with_ports("garbage")
        .with_protocols(vec![Protocol::Icmp]);
    let engine = ReconEngine::new(config.with_service_detection(false))
        .with_discovery(Arc::new(BrokenLink));
    match engine.run().await {
        Ok(report) => {
            assert!(report.hosts.is_empty());
            assert_eq!(engine.state(), EngineState::Done);
        }
        Err(err) => {
            assert!(!matches!(err, ScanError::PortRangeError(_)), "{:?}", err);
            assert_eq!(engine.state(), EngineState::Failed);
        }
    }
}

#[tokio::test]
async fn test_inverted_evasion_delays_fail_preflight() {
    let config = ScanConfig::new("127.0.0.1")
        .with_evasion(true)
        .with_evasion_delays(100, 10);
    let (err, state) = run_failing(config).await;
    assert!(matches!(err, ScanError::ConfigError(_)));
    assert_eq!(state, EngineState::Failed);
}

#[tokio::test]
async fn test_missing_privileges_fail_before_discovery() {
    let discovery = Arc::new(Unprivileged::default());
    let engine = ReconEngine::new(ScanConfig::new("127.0.0.1").with_service_detection(false))
        .with_discovery(discovery.clone());

    let err = engine.run().await.unwrap_err();

    assert!(matches!(err, ScanError::PermissionError(_)));
    assert!(err.is_preflight());
    assert_eq!(engine.state(), EngineState::Failed);
    assert!(!discovery.discovered.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_discovery_failure_degrades_to_empty_run() {
    let engine = ReconEngine::new(ScanConfig::new("127.0.0.1").with_service_detection(false))
        .with_discovery(Arc::new(BrokenLink));

    let report = engine.run().await.unwrap();

    assert_eq!(engine.state(), EngineState::Done);
    assert!(report.hosts.is_empty());
}

#[tokio::test]
async fn test_arp_discovery_of_off_link_network_finishes() {
    // Nothing on this machine sits on TEST-NET-2, so no interface covers the targets
    let config = ScanConfig::new("198.51.100.0/30")
        .with_ports("80")
        .with_discovery(DiscoveryMethod::Arp)
        .with_discovery_timeout(200)
        .with_probe_timeout(200)
        .with_service_detection(false);
    let engine = ReconEngine::new(config);

    match engine.run().await {
        Ok(report) => {
            assert_eq!(engine.state(), EngineState::Done);
            assert!(report.hosts.is_empty(), "{:?}", report.hosts);
        }
        Err(err) => {
            // Unprivileged runs stop at the channel check
            assert!(matches!(err, ScanError::PermissionError(_)), "{:?}", err);
            assert_eq!(engine.state(), EngineState::Failed);
        }
    }
}

#[tokio::test]
async fn test_probe_errors_are_recorded_as_filtered() {
    // The pool only carries a TCP probe, so UDP jobs fail as unsupported
    let host: IpAddr = "127.0.0.1".parse().unwrap();
    let jobs = vec![
        ScanJob::new(host, 53, Protocol::Udp),
        ScanJob::new(host, 123, Protocol::Udp),
    ];
    let queue = Arc::new(JobQueue::from_jobs(jobs).await);
    let (aggregator, sink) = ResultAggregator::spawn(4);
    let pool = WorkerPool::new(
        2,
        ProbeSet::new(&[Protocol::Tcp], Duration::from_millis(200)),
        EvasionThrottle::disabled(),
        CancellationToken::new(),
    );

    let processed = pool.run(queue, sink).await;
    let results = aggregator.finish().await;

    assert_eq!(processed, 2);
    assert_eq!(results.stats().probe_errors, 2);
    for port in [53, 123] {
        let result = results.get(host, port, Protocol::Udp).unwrap();
        assert_eq!(result.state, PortState::Filtered);
        assert!(result.error.as_deref().unwrap_or_default().contains("udp"));
    }
}

#[tokio::test]
async fn test_missing_config_file_is_config_error() {
    let err = ScanConfig::from_toml_file("/nonexistent/netrecon.toml").unwrap_err();
    assert!(matches!(err, ScanError::ConfigError(_)));
}
