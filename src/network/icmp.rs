//! ICMP echo implementation used by the ICMP probe and the topology pass

use crate::ScanError;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::time::timeout;

const ECHO_HEADER_LEN: usize = 8;
const ECHO_PAYLOAD: &[u8] = b"netrecon-echo-probe";
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// ICMP ping result
#[derive(Debug, Clone)]
pub struct PingResult {
    pub target: IpAddr,
    pub success: bool,
    pub rtt: Option<Duration>,
    pub error: Option<String>,
}

impl PingResult {
    fn failed(target: Ipv4Addr, error: String) -> Self {
        Self {
            target: IpAddr::V4(target),
            success: false,
            rtt: None,
            error: Some(error),
        }
    }
}

/// One echo exchange with a single host.
///
/// Each pinger owns its own socket connected to the target, so concurrent pings
/// never steal each other's replies. An unprivileged datagram ICMP socket is tried
/// first and a raw socket second.
pub struct IcmpPinger {
    socket: Socket,
    raw: bool,
    identifier: u16,
    sequence: u16,
}

impl IcmpPinger {
    /// Open an ICMP socket for `target`
    pub fn new(target: Ipv4Addr) -> crate::Result<Self> {
        let (socket, raw) = open_icmp_socket()?;
        let dest = SockAddr::from(SocketAddr::new(IpAddr::V4(target), 0));
        socket
            .connect(&dest)
            .map_err(|e| ScanError::NetworkError(format!("ICMP connect to {}: {}", target, e)))?;

        let mut rng = rand::thread_rng();
        Ok(Self {
            socket,
            raw,
            identifier: rng.gen(),
            sequence: rng.gen(),
        })
    }

    /// Check that an ICMP socket can be opened at all
    pub fn check_available() -> crate::Result<()> {
        open_icmp_socket().map(|_| ())
    }

    /// Send one echo request and wait up to `timeout_duration` for the reply
    pub async fn ping(&self, target: Ipv4Addr, timeout_duration: Duration) -> io::Result<Option<Duration>> {
        let request = build_echo_request(self.identifier, self.sequence)?;
        let start = Instant::now();
        self.socket.send(&request)?;

        match timeout(timeout_duration, self.wait_for_reply()).await {
            Ok(Ok(())) => Ok(Some(start.elapsed())),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                log::trace!("no echo reply from {} within {:?}", target, timeout_duration);
                Ok(None)
            }
        }
    }

    async fn wait_for_reply(&self) -> io::Result<()> {
        let mut buffer = [0u8; 1500];
        loop {
            match (&self.socket).read(&mut buffer) {
                Ok(len) => {
                    if self.is_our_reply(&buffer[..len]) {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_our_reply(&self, bytes: &[u8]) -> bool {
        // Raw sockets deliver the IPv4 header, datagram sockets do not
        let icmp_bytes = if self.raw {
            match Ipv4Packet::new(bytes) {
                Some(ip) => {
                    let offset = ip.get_header_length() as usize * 4;
                    if offset >= bytes.len() {
                        return false;
                    }
                    &bytes[offset..]
                }
                None => return false,
            }
        } else {
            bytes
        };

        let reply = match EchoReplyPacket::new(icmp_bytes) {
            Some(reply) => reply,
            None => return false,
        };
        if reply.get_icmp_type() != IcmpTypes::EchoReply {
            return false;
        }
        // The kernel rewrites the identifier of datagram ICMP sockets
        (!self.raw || reply.get_identifier() == self.identifier)
            && reply.get_sequence_number() == self.sequence
    }
}

fn open_icmp_socket() -> crate::Result<(Socket, bool)> {
    let dgram = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4));
    let (socket, raw) = match dgram {
        Ok(socket) => (socket, false),
        Err(dgram_err) => {
            log::debug!("datagram ICMP socket unavailable ({}), trying raw", dgram_err);
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    ScanError::PermissionError(
                        "ICMP probing needs a raw socket (run as root or grant CAP_NET_RAW)".to_string(),
                    )
                } else {
                    ScanError::NetworkError(e.to_string())
                }
            })?;
            (socket, true)
        }
    };
    socket
        .set_nonblocking(true)
        .map_err(|e| ScanError::NetworkError(e.to_string()))?;
    Ok((socket, raw))
}

/// Build an ICMP echo request with a valid checksum
pub fn build_echo_request(identifier: u16, sequence: u16) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; ECHO_HEADER_LEN + ECHO_PAYLOAD.len()];
    {
        let mut packet = MutableEchoRequestPacket::new(&mut buffer)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "echo buffer too small"))?;
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(ECHO_PAYLOAD);
    }

    let checksum = IcmpPacket::new(&buffer)
        .map(|p| icmp::checksum(&p))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "echo buffer too small"))?;
    buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
    Ok(buffer)
}

/// High-level ping function
pub async fn ping_host(target: Ipv4Addr, timeout_duration: Duration) -> PingResult {
    let pinger = match IcmpPinger::new(target) {
        Ok(pinger) => pinger,
        Err(e) => return PingResult::failed(target, format!("Failed to create pinger: {}", e)),
    };

    match pinger.ping(target, timeout_duration).await {
        Ok(Some(rtt)) => PingResult {
            target: IpAddr::V4(target),
            success: true,
            rtt: Some(rtt),
            error: None,
        },
        Ok(None) => PingResult::failed(target, "Timeout".to_string()),
        Err(e) => PingResult::failed(target, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::icmp::echo_request::EchoRequestPacket;
    use pnet::packet::Packet;

    #[test]
    fn test_echo_request_layout() {
        let bytes = build_echo_request(0x1234, 7).unwrap();
        let packet = EchoRequestPacket::new(&bytes).unwrap();
        assert_eq!(packet.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!(packet.get_identifier(), 0x1234);
        assert_eq!(packet.get_sequence_number(), 7);
        assert_eq!(packet.payload(), ECHO_PAYLOAD);
    }

    #[test]
    fn test_echo_request_checksum_verifies() {
        let bytes = build_echo_request(42, 42).unwrap();
        let packet = IcmpPacket::new(&bytes).unwrap();
        assert_eq!(icmp::checksum(&packet), packet.get_checksum());
    }
}
