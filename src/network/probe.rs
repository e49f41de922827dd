//! Per-protocol probes used by the worker pool
//!
//! A probe performs one timed attempt against `(host, port)` and classifies the
//! port. The set of probes is fixed when the scan is configured; workers never
//! decide how to probe, they only look up the probe for a job's protocol.

use super::icmp::IcmpPinger;
use super::{PortState, Protocol};
use crate::error::ProbeError;
use crate::ScanError;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

/// Datagram sent to UDP ports; most services ignore it, some answer with an error
const UDP_PROBE_PAYLOAD: &[u8] = b"A";

/// Full TCP connect probe
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn probe(&self, host: IpAddr, port: u16) -> Result<PortState, ProbeError> {
        let addr = SocketAddr::new(host, port);
        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(PortState::Open)
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(PortState::Closed),
            Ok(Err(e)) => Err(ProbeError::from_io(e, &addr.to_string())),
            Err(_) => Ok(PortState::Filtered),
        }
    }
}

/// UDP probe on a connected socket
///
/// Connecting the socket lets the kernel surface ICMP port-unreachable as
/// `ConnectionRefused`, which is the only reliable "closed" signal for UDP.
#[derive(Debug, Clone, Copy)]
pub struct UdpProbe {
    timeout: Duration,
}

impl UdpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn probe(&self, host: IpAddr, port: u16) -> Result<PortState, ProbeError> {
        let addr = SocketAddr::new(host, port);
        let target = addr.to_string();
        let bind_addr = match host {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ProbeError::from_io(e, &target))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| ProbeError::from_io(e, &target))?;

        match socket.send(UDP_PROBE_PAYLOAD).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => return Ok(PortState::Closed),
            Err(e) => return Err(ProbeError::from_io(e, &target)),
        }

        let mut buffer = [0u8; 1024];
        match timeout(self.timeout, socket.recv(&mut buffer)).await {
            Ok(Ok(_)) => Ok(PortState::Open),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(PortState::Closed),
            Ok(Err(e)) => Err(ProbeError::from_io(e, &target)),
            // Silence is indistinguishable from a dropped probe
            Err(_) => Ok(PortState::Filtered),
        }
    }
}

/// ICMP echo probe, scanned as pseudo-port 0
#[derive(Debug, Clone, Copy)]
pub struct IcmpProbe {
    timeout: Duration,
}

impl IcmpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn probe(&self, host: IpAddr) -> Result<PortState, ProbeError> {
        let target = match host {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => {
                return Err(ProbeError::Unsupported(format!("ICMPv6 echo to {}", v6)));
            }
        };

        let pinger = IcmpPinger::new(target).map_err(|e| match e {
            ScanError::PermissionError(msg) => ProbeError::PermissionDenied(msg),
            other => ProbeError::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
        })?;

        match pinger.ping(target, self.timeout).await {
            Ok(Some(_rtt)) => Ok(PortState::Open),
            Ok(None) => Ok(PortState::Filtered),
            Err(e) => Err(ProbeError::from_io(e, &target.to_string())),
        }
    }
}

/// Closed set of probe variants
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    Tcp(TcpProbe),
    Udp(UdpProbe),
    Icmp(IcmpProbe),
}

impl Probe {
    pub fn for_protocol(protocol: Protocol, timeout: Duration) -> Self {
        match protocol {
            Protocol::Tcp => Probe::Tcp(TcpProbe::new(timeout)),
            Protocol::Udp => Probe::Udp(UdpProbe::new(timeout)),
            Protocol::Icmp => Probe::Icmp(IcmpProbe::new(timeout)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Probe::Tcp(_) => Protocol::Tcp,
            Probe::Udp(_) => Protocol::Udp,
            Probe::Icmp(_) => Protocol::Icmp,
        }
    }

    /// Classify one port; `port` is ignored for ICMP
    pub async fn probe(&self, host: IpAddr, port: u16) -> Result<PortState, ProbeError> {
        match self {
            Probe::Tcp(p) => p.probe(host, port).await,
            Probe::Udp(p) => p.probe(host, port).await,
            Probe::Icmp(p) => p.probe(host).await,
        }
    }
}

/// Probes selected once from the configured protocols
#[derive(Debug, Clone, Default)]
pub struct ProbeSet {
    probes: Vec<Probe>,
}

impl ProbeSet {
    pub fn new(protocols: &[Protocol], timeout: Duration) -> Self {
        let mut probes: Vec<Probe> = Vec::with_capacity(protocols.len());
        for protocol in protocols {
            if !probes.iter().any(|p| p.protocol() == *protocol) {
                probes.push(Probe::for_protocol(*protocol, timeout));
            }
        }
        Self { probes }
    }

    pub fn get(&self, protocol: Protocol) -> Option<&Probe> {
        self.probes.iter().find(|p| p.protocol() == protocol)
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        self.probes.iter().map(|p| p.protocol()).collect()
    }

    pub async fn probe(&self, host: IpAddr, port: u16, protocol: Protocol) -> Result<PortState, ProbeError> {
        match self.get(protocol) {
            Some(probe) => probe.probe(host, port).await,
            None => Err(ProbeError::Unsupported(format!("no {} probe configured", protocol))),
        }
    }
}
