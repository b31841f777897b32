//! Construction of complete Ethernet + IP + TCP frames.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::packet::ethernet::{EtherType, EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::{self, MutableTcpPacket};
use pnet::util::MacAddr;
use synack_common::network::packet::TcpFlags;

use super::PacketError;

pub const ETH_HDR_LEN: usize = 14;
pub const IP_V4_HDR_LEN: usize = 20;
pub const IP_V6_HDR_LEN: usize = 40;
pub const TCP_HDR_LEN: usize = 20;

const DEFAULT_TTL: u8 = 64;
const DONT_FRAGMENT: u8 = 0b010;

/// Everything needed to put one TCP segment on the wire.
#[derive(Debug, Clone)]
pub struct Segment<'a> {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

pub fn build_frame(segment: &Segment) -> Result<Vec<u8>, PacketError> {
    match (segment.src_addr, segment.dst_addr) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => build_v4(segment, src, dst),
        (IpAddr::V6(src), IpAddr::V6(dst)) => build_v6(segment, src, dst),
        (src, dst) => Err(PacketError::FamilyMismatch { src, dst }),
    }
}

fn build_v4(segment: &Segment, src: Ipv4Addr, dst: Ipv4Addr) -> Result<Vec<u8>, PacketError> {
    let tcp_len: usize = TCP_HDR_LEN + segment.payload.len();
    let ip_end: usize = ETH_HDR_LEN + IP_V4_HDR_LEN;
    let mut buffer: Vec<u8> = vec![0u8; ip_end + tcp_len];

    write_ethernet(&mut buffer, segment, EtherTypes::Ipv4)?;

    {
        let mut ip = MutableIpv4Packet::new(&mut buffer[ETH_HDR_LEN..ip_end])
            .ok_or(PacketError::Buffer("ipv4"))?;
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_dscp(0);
        ip.set_ecn(0);
        ip.set_total_length((IP_V4_HDR_LEN + tcp_len) as u16);
        ip.set_identification(rand::random());
        ip.set_flags(DONT_FRAGMENT);
        ip.set_fragment_offset(0);
        ip.set_ttl(DEFAULT_TTL);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(src);
        ip.set_destination(dst);
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }

    {
        let mut tcp = MutableTcpPacket::new(&mut buffer[ip_end..]).ok_or(PacketError::Buffer("tcp"))?;
        write_tcp(&mut tcp, segment);
        let checksum = tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst);
        tcp.set_checksum(checksum);
    }

    Ok(buffer)
}

fn build_v6(segment: &Segment, src: Ipv6Addr, dst: Ipv6Addr) -> Result<Vec<u8>, PacketError> {
    let tcp_len: usize = TCP_HDR_LEN + segment.payload.len();
    let ip_end: usize = ETH_HDR_LEN + IP_V6_HDR_LEN;
    let mut buffer: Vec<u8> = vec![0u8; ip_end + tcp_len];

    write_ethernet(&mut buffer, segment, EtherTypes::Ipv6)?;

    {
        let mut ip = MutableIpv6Packet::new(&mut buffer[ETH_HDR_LEN..ip_end])
            .ok_or(PacketError::Buffer("ipv6"))?;
        ip.set_version(6);
        ip.set_traffic_class(0);
        ip.set_flow_label(0);
        ip.set_payload_length(tcp_len as u16);
        ip.set_next_header(IpNextHeaderProtocols::Tcp);
        ip.set_hop_limit(DEFAULT_TTL);
        ip.set_source(src);
        ip.set_destination(dst);
    }

    {
        let mut tcp = MutableTcpPacket::new(&mut buffer[ip_end..]).ok_or(PacketError::Buffer("tcp"))?;
        write_tcp(&mut tcp, segment);
        let checksum = tcp::ipv6_checksum(&tcp.to_immutable(), &src, &dst);
        tcp.set_checksum(checksum);
    }

    Ok(buffer)
}

fn write_ethernet(buffer: &mut [u8], segment: &Segment, ether_type: EtherType) -> Result<(), PacketError> {
    let mut eth = MutableEthernetPacket::new(&mut buffer[..ETH_HDR_LEN])
        .ok_or(PacketError::Buffer("ethernet"))?;
    eth.set_source(segment.src_mac);
    eth.set_destination(segment.dst_mac);
    eth.set_ethertype(ether_type);
    Ok(())
}

fn write_tcp(tcp: &mut MutableTcpPacket, segment: &Segment) {
    tcp.set_source(segment.src_port);
    tcp.set_destination(segment.dst_port);
    tcp.set_sequence(segment.seq);
    tcp.set_acknowledgement(segment.ack);
    tcp.set_data_offset(5);
    tcp.set_flags(segment.flags.bits().into());
    tcp.set_window(segment.window);
    tcp.set_urgent_ptr(0);
    tcp.set_payload(segment.payload);
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
