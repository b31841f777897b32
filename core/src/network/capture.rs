use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, bail};
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use synack_common::network::packet::{PacketMetadata, TcpFlags};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::PacketWriter;

const READ_TIMEOUT_MS: u64 = 100;

/// Raw frame sender over a datalink channel.
pub struct DatalinkWriter {
    tx: Mutex<Box<dyn DataLinkSender>>,
}

impl DatalinkWriter {
    pub fn new(tx: Box<dyn DataLinkSender>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl PacketWriter for DatalinkWriter {
    fn write_packet_data(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.send_to(frame, None) {
            Some(result) => result,
            None => Err(std::io::Error::other("datalink sender refused frame")),
        }
    }
}

pub struct CaptureHandle {
    pub writer: Arc<DatalinkWriter>,
    pub rx: mpsc::Receiver<PacketMetadata>,
}

/// Opens an Ethernet channel on `intf` and forwards every TCP segment
/// addressed to one of `ports` into a bounded queue. The listener thread
/// exits once the receiving half of the queue is dropped.
pub fn start_capture(
    intf: &NetworkInterface,
    ports: RangeInclusive<u16>,
    capacity: usize,
) -> anyhow::Result<CaptureHandle> {
    let (tx, rx_socket) = open_eth_channel(intf, &get_config(), datalink::channel)?;
    let (queue_tx, queue_rx) = mpsc::channel(capacity);

    info!("Capturing on {} for ports {}-{}", intf.name, ports.start(), ports.end());
    std::thread::spawn(move || listen(rx_socket, queue_tx, ports));

    Ok(CaptureHandle {
        writer: Arc::new(DatalinkWriter::new(tx)),
        rx: queue_rx,
    })
}

fn listen(
    mut rx: Box<dyn DataLinkReceiver>,
    queue: mpsc::Sender<PacketMetadata>,
    ports: RangeInclusive<u16>,
) {
    loop {
        if queue.is_closed() {
            break;
        }
        let frame = match rx.next() {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let Some(packet) = parse_frame(frame) else {
            continue;
        };
        if !ports.contains(&packet.dst_port) {
            continue;
        }
        if queue.blocking_send(packet).is_err() {
            break;
        }
    }
    debug!("Capture listener stopped");
}

fn open_eth_channel<F>(
    intf: &NetworkInterface,
    cfg: &Config,
    channel_opener: F,
) -> anyhow::Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>)>
where
    F: FnOnce(&NetworkInterface, Config) -> std::io::Result<datalink::Channel>,
{
    let ch: Channel = channel_opener(intf, *cfg).with_context(|| format!("opening on {}", intf.name))?;
    match ch {
        Channel::Ethernet(tx, rx) => Ok((tx, rx)),
        _ => bail!("non-ethernet channel for {}", intf.name),
    }
}

fn get_config() -> Config {
    Config {
        read_timeout: Some(Duration::from_millis(READ_TIMEOUT_MS)),
        ..Default::default()
    }
}

/// Parses an Ethernet frame carrying IPv4 or IPv6 TCP. Anything else is `None`.
pub fn parse_frame(frame: &[u8]) -> Option<PacketMetadata> {
    let eth = EthernetPacket::new(frame)?;
    let (src_addr, dst_addr, ttl, transport): (IpAddr, IpAddr, u8, Vec<u8>) = match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(eth.payload())?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            let header_len = usize::from(ip.get_header_length()) * 4;
            let total_len = usize::from(ip.get_total_length()).min(ip.packet().len());
            let segment = ip.packet().get(header_len..total_len)?.to_vec();
            (ip.get_source().into(), ip.get_destination().into(), ip.get_ttl(), segment)
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(eth.payload())?;
            if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            (ip.get_source().into(), ip.get_destination().into(), ip.get_hop_limit(), ip.payload().to_vec())
        }
        _ => return None,
    };

    let tcp = TcpPacket::new(&transport)?;
    let flags = TcpFlags::from_bits((u16::from(tcp.get_flags()) & 0xff) as u8);
    let mut packet = PacketMetadata::new(src_addr, tcp.get_source(), dst_addr, tcp.get_destination())
        .with_macs(eth.get_source(), eth.get_destination())
        .with_sequence(tcp.get_sequence(), tcp.get_acknowledgement())
        .with_payload(tcp.payload());
    packet.flags = flags;
    packet.window = tcp.get_window();
    packet.ttl = ttl;
    Some(packet)
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
