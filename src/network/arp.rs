//! ARP request construction and reply parsing

use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use std::net::Ipv4Addr;

pub const ETH_HEADER_LEN: usize = 14;
pub const ARP_LEN: usize = 28;
/// Minimum Ethernet frame without FCS; short frames are padded to this size
pub const MIN_ETH_FRAME: usize = 60;

/// Build a broadcast ARP "who-has `target`" frame
pub fn build_request(src_mac: MacAddr, src_addr: Ipv4Addr, target: Ipv4Addr) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; MIN_ETH_FRAME];
    {
        let mut eth = MutableEthernetPacket::new(&mut buffer)?;
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Arp);
    }

    let mut arp = MutableArpPacket::new(&mut buffer[ETH_HEADER_LEN..ETH_HEADER_LEN + ARP_LEN])?;
    arp.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp.set_protocol_type(EtherTypes::Ipv4);
    arp.set_hw_addr_len(6);
    arp.set_proto_addr_len(4);
    arp.set_operation(ArpOperations::Request);
    arp.set_sender_hw_addr(src_mac);
    arp.set_sender_proto_addr(src_addr);
    arp.set_target_hw_addr(MacAddr::zero());
    arp.set_target_proto_addr(target);
    Some(buffer)
}

/// Extract `(sender ip, sender mac)` from an ARP reply frame
pub fn parse_reply(frame: &[u8]) -> Option<(Ipv4Addr, MacAddr)> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(eth.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }
    Some((arp.get_sender_proto_addr(), arp.get_sender_hw_addr()))
}
