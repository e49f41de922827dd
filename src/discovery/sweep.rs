//! Unprivileged discovery by TCP connect sweep
//!
//! A host counts as alive when any sweep port accepts or actively refuses the
//! connection. Silence and unreachable errors mean nothing answered.

use super::{order_by_targets, Host, HostDiscovery};
use crate::Result;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

/// Ports commonly open (or at least answering) on LAN hosts
pub const SWEEP_PORTS: &[u16] = &[22, 80, 443, 445, 139, 53, 3389, 8080];
const DEFAULT_CONCURRENCY: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnectSweep {
    ports: Vec<u16>,
    concurrency: usize,
}

impl Default for ConnectSweep {
    fn default() -> Self {
        Self {
            ports: SWEEP_PORTS.to_vec(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ConnectSweep {
    pub fn with_ports(ports: Vec<u16>) -> Self {
        Self {
            ports,
            ..Default::default()
        }
    }

    async fn is_alive(&self, target: IpAddr, deadline: Instant) -> bool {
        let attempts = self.ports.iter().map(|&port| async move {
            let outcome = timeout_at(deadline, TcpStream::connect(SocketAddr::new(target, port)))
                .await
                .ok()
                .map(|connected| connected.map(|_| ()));
            answered(outcome)
        });
        futures::future::join_all(attempts).await.into_iter().any(|alive| alive)
    }
}

/// `None` means the deadline passed before the connect finished
fn answered(outcome: Option<io::Result<()>>) -> bool {
    match outcome {
        Some(Ok(())) => true,
        Some(Err(e)) => e.kind() == io::ErrorKind::ConnectionRefused,
        None => false,
    }
}

#[async_trait::async_trait]
impl HostDiscovery for ConnectSweep {
    fn method_name(&self) -> &str {
        "connect-sweep"
    }

    fn check_privileges(&self, _targets: &[IpAddr]) -> Result<()> {
        Ok(())
    }

    async fn discover(&self, targets: &[IpAddr], timeout: Duration) -> Result<Vec<Host>> {
        let deadline = Instant::now() + timeout;
        log::info!(
            "Connect sweep of {} targets over ports {:?}",
            targets.len(),
            self.ports
        );

        let found: HashMap<IpAddr, Host> = stream::iter(targets.iter().copied())
            .map(|target| async move { (target, self.is_alive(target, deadline).await) })
            .buffer_unordered(self.concurrency.max(1))
            .filter_map(|(target, alive)| async move {
                if alive {
                    log::debug!("{} answered the connect sweep", target);
                    Some((target, Host::new(target, None)))
                } else {
                    None
                }
            })
            .collect()
            .await;

        Ok(order_by_targets(targets, found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_listening_host_is_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let sweep = ConnectSweep::with_ports(vec![port]);
        let hosts = sweep
            .discover(&["127.0.0.1".parse().unwrap()], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(hosts[0].link_layer_id.is_none());
    }

    #[tokio::test]
    async fn test_refusal_proves_liveness() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sweep = ConnectSweep::with_ports(vec![port]);
        let hosts = sweep
            .discover(&["127.0.0.1".parse().unwrap()], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn test_only_accept_or_refusal_counts_as_alive() {
        assert!(answered(Some(Ok(()))));
        assert!(answered(Some(Err(io::ErrorKind::ConnectionRefused.into()))));
        assert!(!answered(None));
        for kind in [io::ErrorKind::TimedOut, io::ErrorKind::PermissionDenied, io::ErrorKind::Other] {
            assert!(!answered(Some(Err(kind.into()))), "{:?}", kind);
        }
    }

    #[tokio::test]
    async fn test_sweep_honours_deadline() {
        // TEST-NET-1 may be dropped or refused depending on the network; only timing is fixed
        let target: IpAddr = "192.0.2.1".parse().unwrap();
        let sweep = ConnectSweep::with_ports(vec![80, 443]);
        let started = std::time::Instant::now();
        let hosts = sweep.discover(&[target], Duration::from_millis(200)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(hosts.iter().all(|h| h.address == target));
    }

    #[test]
    fn test_no_privilege_needed() {
        assert!(ConnectSweep::default().check_privileges(&[]).is_ok());
    }
}
