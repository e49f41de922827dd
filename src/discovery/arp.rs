//! ARP broadcast discovery over a pnet datalink channel

use super::{order_by_targets, Host, HostDiscovery};
use crate::network::arp::{build_request, parse_reply};
use crate::{Result, ScanError};
use ipnetwork::IpNetwork;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::util::MacAddr;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Sends one ARP who-has per IPv4 target and listens for replies
#[derive(Debug, Clone, Default)]
pub struct ArpDiscovery {
    interface: Option<String>,
}

impl ArpDiscovery {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }

    /// Named interface, or the first up non-loopback one on the target's network
    pub fn select_interface(&self, targets: &[IpAddr]) -> Result<NetworkInterface> {
        let interfaces = datalink::interfaces();

        if let Some(name) = &self.interface {
            return interfaces
                .into_iter()
                .find(|iface| &iface.name == name)
                .ok_or_else(|| ScanError::NetworkError(format!("Interface {} not found", name)));
        }

        let first_v4 = targets.iter().find_map(|t| match t {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        });

        interfaces
            .into_iter()
            .filter(|iface| iface.is_up() && !iface.is_loopback() && iface.mac.is_some())
            .find(|iface| match first_v4 {
                Some(target) => source_address(iface, target).is_some(),
                None => false,
            })
            .ok_or_else(|| {
                ScanError::NetworkError(
                    "No up, non-loopback interface with an IPv4 network containing the targets".to_string(),
                )
            })
    }

    /// Interface used to test raw link-layer access, independent of the targets
    fn privilege_interface(&self) -> Result<Option<NetworkInterface>> {
        let mut interfaces = datalink::interfaces().into_iter();
        match &self.interface {
            Some(name) => interfaces
                .find(|iface| &iface.name == name)
                .map(Some)
                .ok_or_else(|| ScanError::ConfigError(format!("Interface {} not found", name))),
            None => Ok(interfaces.find(|iface| iface.is_up() && !iface.is_loopback() && iface.mac.is_some())),
        }
    }
}

#[async_trait::async_trait]
impl HostDiscovery for ArpDiscovery {
    fn method_name(&self) -> &str {
        "arp"
    }

    fn check_privileges(&self, _targets: &[IpAddr]) -> Result<()> {
        let interface = self.privilege_interface()?;
        check_channel_access(interface.as_ref(), datalink::channel)
    }

    async fn discover(&self, targets: &[IpAddr], timeout: Duration) -> Result<Vec<Host>> {
        let wanted: Vec<Ipv4Addr> = targets
            .iter()
            .filter_map(|t| match t {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(v6) => {
                    log::debug!("ARP cannot resolve IPv6 target {}, skipping", v6);
                    None
                }
            })
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let interface = match self.select_interface(targets) {
            Ok(interface) => interface,
            Err(e) => {
                log::warn!("ARP discovery found no hosts: {}", e);
                return Ok(Vec::new());
            }
        };
        let found = tokio::task::spawn_blocking(move || arp_sweep(&interface, &wanted, timeout))
            .await
            .map_err(|e| ScanError::NetworkError(format!("ARP discovery task failed: {}", e)))??;

        let by_address: HashMap<IpAddr, Host> = found
            .into_iter()
            .map(|(ip, mac)| (IpAddr::V4(ip), Host::new(IpAddr::V4(ip), Some(mac))))
            .collect();
        Ok(order_by_targets(targets, by_address))
    }
}

fn arp_sweep(
    interface: &NetworkInterface,
    targets: &[Ipv4Addr],
    timeout: Duration,
) -> Result<HashMap<Ipv4Addr, MacAddr>> {
    let src_mac = interface
        .mac
        .ok_or_else(|| ScanError::NetworkError(format!("{} has no hardware address", interface.name)))?;
    let src_addr = source_address(interface, targets[0]).ok_or_else(|| {
        ScanError::NetworkError(format!("{} has no IPv4 address on the target network", interface.name))
    })?;

    let (mut tx, mut rx) = open_eth_channel(interface, &channel_config(), datalink::channel)?;
    log::info!(
        "ARP discovery of {} targets on {} ({} / {})",
        targets.len(),
        interface.name,
        src_addr,
        src_mac
    );

    send_requests(tx.as_mut(), src_mac, src_addr, targets);

    let wanted: HashSet<Ipv4Addr> = targets.iter().copied().collect();
    Ok(collect_replies(rx.as_mut(), &wanted, Instant::now() + timeout))
}

fn send_requests(tx: &mut dyn DataLinkSender, src_mac: MacAddr, src_addr: Ipv4Addr, targets: &[Ipv4Addr]) {
    for target in targets {
        let Some(frame) = build_request(src_mac, src_addr, *target) else {
            continue;
        };
        match tx.send_to(&frame, None) {
            Some(Ok(())) => {}
            Some(Err(e)) => log::warn!("ARP request to {} failed: {}", target, e),
            None => log::warn!("ARP request to {} was not sent", target),
        }
    }
}

/// Listen until `deadline`; the first reply per address wins
fn collect_replies(
    rx: &mut dyn DataLinkReceiver,
    wanted: &HashSet<Ipv4Addr>,
    deadline: Instant,
) -> HashMap<Ipv4Addr, MacAddr> {
    let mut found = HashMap::new();
    while Instant::now() < deadline && found.len() < wanted.len() {
        match rx.next() {
            Ok(frame) => {
                if let Some((ip, mac)) = parse_reply(frame) {
                    if wanted.contains(&ip) && !found.contains_key(&ip) {
                        log::debug!("ARP reply from {} ({})", ip, mac);
                        found.insert(ip, mac);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::trace!("datalink read error: {}", e),
        }
    }
    found
}

fn source_address(interface: &NetworkInterface, target: Ipv4Addr) -> Option<Ipv4Addr> {
    interface.ips.iter().find_map(|net| match net {
        IpNetwork::V4(v4) if v4.contains(target) => Some(v4.ip()),
        _ => None,
    })
}

fn channel_config() -> Config {
    Config {
        read_timeout: Some(READ_TIMEOUT),
        ..Default::default()
    }
}

/// Only a denied channel fails; other open errors are left for discovery to report
fn check_channel_access<F>(interface: Option<&NetworkInterface>, channel_opener: F) -> Result<()>
where
    F: FnOnce(&NetworkInterface, Config) -> io::Result<Channel>,
{
    let Some(interface) = interface else {
        log::warn!("No up, non-loopback interface for ARP discovery");
        return Ok(());
    };
    match open_eth_channel(interface, &channel_config(), channel_opener) {
        Ok(_) => {
            log::debug!("Opened datalink channel on {}", interface.name);
            Ok(())
        }
        Err(e @ ScanError::PermissionError(_)) => Err(e),
        Err(e) => {
            log::warn!("{}", e);
            Ok(())
        }
    }
}

fn open_eth_channel<F>(
    interface: &NetworkInterface,
    config: &Config,
    channel_opener: F,
) -> Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>)>
where
    F: FnOnce(&NetworkInterface, Config) -> io::Result<Channel>,
{
    match channel_opener(interface, *config) {
        Ok(Channel::Ethernet(tx, rx)) => Ok((tx, rx)),
        Ok(_) => Err(ScanError::NetworkError(format!(
            "non-ethernet channel for {}",
            interface.name
        ))),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Err(ScanError::PermissionError(format!(
            "ARP discovery on {} needs raw socket privilege (run as root or use --discovery connect)",
            interface.name
        ))),
        Err(e) => Err(ScanError::NetworkError(format!("opening on {}: {}", interface.name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::arp::{ARP_LEN, ETH_HEADER_LEN, MIN_ETH_FRAME};
    use pnet::datalink::dummy;
    use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
    use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
    use std::collections::VecDeque;

    struct ScriptedReceiver {
        frames: VecDeque<Vec<u8>>,
        current: Vec<u8>,
    }

    impl DataLinkReceiver for ScriptedReceiver {
        fn next(&mut self) -> io::Result<&[u8]> {
            match self.frames.pop_front() {
                Some(frame) => {
                    self.current = frame;
                    Ok(&self.current)
                }
                None => {
                    std::thread::sleep(Duration::from_millis(5));
                    Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                }
            }
        }
    }

    fn reply(ip: Ipv4Addr, mac: MacAddr) -> Vec<u8> {
        let mut buffer = vec![0u8; MIN_ETH_FRAME];
        {
            let mut eth = MutableEthernetPacket::new(&mut buffer).unwrap();
            eth.set_source(mac);
            eth.set_ethertype(EtherTypes::Arp);
        }
        let mut arp = MutableArpPacket::new(&mut buffer[ETH_HEADER_LEN..ETH_HEADER_LEN + ARP_LEN]).unwrap();
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Reply);
        arp.set_sender_hw_addr(mac);
        arp.set_sender_proto_addr(ip);
        buffer
    }

    #[test]
    fn test_collect_replies_filters_and_keeps_first() {
        let a = Ipv4Addr::new(192, 168, 1, 2);
        let b = Ipv4Addr::new(192, 168, 1, 3);
        let stranger = Ipv4Addr::new(192, 168, 1, 99);
        let mac_a = MacAddr::new(2, 0, 0, 0, 0, 2);

        let mut rx = ScriptedReceiver {
            frames: VecDeque::from(vec![
                reply(stranger, MacAddr::new(2, 0, 0, 0, 0, 99)),
                reply(a, mac_a),
                reply(a, MacAddr::new(2, 0, 0, 0, 0, 0xff)),
            ]),
            current: Vec::new(),
        };
        let wanted: HashSet<_> = [a, b].into_iter().collect();

        let found = collect_replies(&mut rx, &wanted, Instant::now() + Duration::from_millis(100));
        assert_eq!(found.len(), 1);
        assert_eq!(found.get(&a), Some(&mac_a));
    }

    #[test]
    fn test_collect_replies_respects_deadline() {
        let mut rx = ScriptedReceiver {
            frames: VecDeque::new(),
            current: Vec::new(),
        };
        let wanted: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 1)].into_iter().collect();
        let start = Instant::now();
        let found = collect_replies(&mut rx, &wanted, start + Duration::from_millis(60));
        assert!(found.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_open_eth_channel_on_dummy_interface() {
        let iface = dummy::dummy_interface(0);
        let opener = |i: &NetworkInterface, _cfg: Config| -> io::Result<Channel> {
            dummy::channel(i, dummy::Config::default())
        };
        assert!(open_eth_channel(&iface, &Config::default(), opener).is_ok());
    }

    #[test]
    fn test_permission_denied_is_permission_error() {
        let iface = dummy::dummy_interface(0);
        let opener = |_: &NetworkInterface, _: Config| -> io::Result<Channel> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "Operation not permitted"))
        };
        let err = open_eth_channel(&iface, &Config::default(), opener).err().unwrap();
        assert!(matches!(err, ScanError::PermissionError(_)));
    }

    #[test]
    fn test_unknown_interface_is_network_error() {
        let discovery = ArpDiscovery::new(Some("no-such-iface0".to_string()));
        let err = discovery.select_interface(&["10.0.0.1".parse().unwrap()]).unwrap_err();
        assert!(matches!(err, ScanError::NetworkError(_)));
    }

    #[test]
    fn test_unknown_interface_fails_privilege_check() {
        let discovery = ArpDiscovery::new(Some("no-such-iface0".to_string()));
        let err = discovery.check_privileges(&["10.0.0.1".parse().unwrap()]).unwrap_err();
        assert!(matches!(err, ScanError::ConfigError(_)));
    }

    #[test]
    fn test_channel_access_only_fails_when_denied() {
        let iface = dummy::dummy_interface(0);
        let denied = |_: &NetworkInterface, _: Config| -> io::Result<Channel> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "Operation not permitted"))
        };
        let err = check_channel_access(Some(&iface), denied).unwrap_err();
        assert!(matches!(err, ScanError::PermissionError(_)));

        let unavailable = |_: &NetworkInterface, _: Config| -> io::Result<Channel> {
            Err(io::Error::new(io::ErrorKind::Other, "device busy"))
        };
        assert!(check_channel_access(Some(&iface), unavailable).is_ok());

        let untouched = |_: &NetworkInterface, _: Config| -> io::Result<Channel> {
            panic!("no interface, nothing to open")
        };
        assert!(check_channel_access(None, untouched).is_ok());
    }

    #[tokio::test]
    async fn test_off_link_targets_discover_nothing() {
        // The named interface cannot exist, so no interface covers the targets
        let discovery = ArpDiscovery::new(Some("no-such-iface0".to_string()));
        let targets: Vec<IpAddr> = vec!["198.51.100.1".parse().unwrap(), "198.51.100.2".parse().unwrap()];
        let hosts = discovery.discover(&targets, Duration::from_millis(50)).await.unwrap();
        assert!(hosts.is_empty());
    }
}
