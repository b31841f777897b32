//! Opens connections: SYNs for new targets, then ACK plus probe data once a
//! target accepts the handshake.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::Context;
use pnet::util::MacAddr;
use synack_common::network::filter::TargetFilter;
use synack_common::network::packet::{PacketMetadata, ScanIdentity, TcpFlags};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::network::PacketWriter;
use crate::network::tcp::{self, Segment};
use crate::state::{Handshake, StateTable};
use crate::timeout::TimeoutQueue;

const SYN_WINDOW: u16 = 64_240;

#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub src_mac: MacAddr,
    pub gateway_mac: MacAddr,
    pub local_v4: Option<Ipv4Addr>,
    pub local_v6: Option<Ipv6Addr>,
}

impl LinkConfig {
    fn local_for(&self, remote: IpAddr) -> Option<IpAddr> {
        match remote {
            IpAddr::V4(_) => self.local_v4.map(IpAddr::V4),
            IpAddr::V6(_) => self.local_v6.map(IpAddr::V6),
        }
    }
}

/// Data sent once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbePayload {
    /// Send nothing and wait for the service to speak first.
    #[default]
    Wait,
    Http,
}

impl ProbePayload {
    pub fn render(&self, remote: IpAddr) -> Vec<u8> {
        match self {
            ProbePayload::Wait => Vec::new(),
            ProbePayload::Http => format!(
                "GET / HTTP/1.1\r\nHost: {remote}\r\nUser-Agent: synack\r\nAccept: */*\r\n\r\n"
            )
            .into_bytes(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub link: LinkConfig,
    pub ports: RangeInclusive<u16>,
    pub payload: ProbePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Sent,
    Blocked,
    /// No local address of the target's family is configured.
    Unroutable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStats {
    pub sent: u64,
    pub blocked: u64,
    pub followups: u64,
}

pub struct Prober {
    table: Arc<StateTable>,
    filter: Arc<TargetFilter>,
    writer: Arc<dyn PacketWriter>,
    timeouts: TimeoutQueue,
    cfg: ProbeConfig,
    next_port: AtomicU32,
    sent: AtomicU64,
    blocked: AtomicU64,
    followups: AtomicU64,
}

impl Prober {
    pub fn new(
        table: Arc<StateTable>,
        filter: Arc<TargetFilter>,
        writer: Arc<dyn PacketWriter>,
        timeouts: TimeoutQueue,
        cfg: ProbeConfig,
    ) -> Self {
        Self {
            table,
            filter,
            writer,
            timeouts,
            cfg,
            next_port: AtomicU32::new(0),
            sent: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            followups: AtomicU64::new(0),
        }
    }

    fn allocate_port(&self) -> u16 {
        let start = u32::from(*self.cfg.ports.start());
        let span = u32::from(*self.cfg.ports.end()).saturating_sub(start) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        (start + offset) as u16
    }

    /// Sends a SYN to `target` unless the filter blocks it.
    ///
    /// The handshake is registered before the SYN leaves, so a fast SYN-ACK
    /// always finds its state.
    pub async fn probe(&self, target: SocketAddr) -> anyhow::Result<ProbeStatus> {
        if self.filter.is_blocked(target.ip()) {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            trace!("Skipping blocked target {target}");
            return Ok(ProbeStatus::Blocked);
        }
        let Some(local_addr) = self.cfg.link.local_for(target.ip()) else {
            return Ok(ProbeStatus::Unroutable);
        };

        let identity = ScanIdentity {
            remote_addr: target.ip(),
            remote_port: target.port(),
            local_addr,
            local_port: self.allocate_port(),
        };
        let isn: u32 = rand::random();
        self.table.register(Handshake::new(identity, isn));

        let segment = Segment {
            src_mac: self.cfg.link.src_mac,
            dst_mac: self.cfg.link.gateway_mac,
            src_addr: local_addr,
            dst_addr: target.ip(),
            src_port: identity.local_port,
            dst_port: identity.remote_port,
            seq: isn,
            ack: 0,
            flags: TcpFlags::from_bits(TcpFlags::SYN),
            window: SYN_WINDOW,
            payload: &[],
        };
        let sent = tcp::build_frame(&segment)
            .map_err(anyhow::Error::from)
            .and_then(|frame| self.writer.write_packet_data(&frame).map_err(anyhow::Error::from));
        if let Err(e) = sent {
            self.table.remove(identity);
            return Err(e).with_context(|| format!("sending SYN to {target}"));
        }

        self.sent.fetch_add(1, Ordering::Relaxed);
        self.timeouts.push(PacketMetadata::awaiting(identity)).await?;
        Ok(ProbeStatus::Sent)
    }

    /// Completes an accepted handshake and sends the configured probe data.
    pub fn follow_up(&self, synack: &PacketMetadata) -> anyhow::Result<()> {
        let identity = synack.identity();
        let payload = self.cfg.payload.render(identity.remote_addr);

        if !self.table.record_probe(identity, payload.len() as u32) {
            debug!("{identity} finished before follow-up");
            return Ok(());
        }

        let flags = match payload.is_empty() {
            true => TcpFlags::ACK,
            false => TcpFlags::ACK | TcpFlags::PSH,
        };
        let segment = Segment {
            src_mac: self.cfg.link.src_mac,
            dst_mac: self.cfg.link.gateway_mac,
            src_addr: identity.local_addr,
            dst_addr: identity.remote_addr,
            src_port: identity.local_port,
            dst_port: identity.remote_port,
            seq: synack.ack,
            ack: synack.seq.wrapping_add(1),
            flags: TcpFlags::from_bits(flags),
            window: SYN_WINDOW,
            payload: &payload,
        };
        let frame = tcp::build_frame(&segment)?;
        self.writer
            .write_packet_data(&frame)
            .with_context(|| format!("sending follow-up to {identity}"))?;
        self.followups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Answers accepted handshakes until the classifier drops its sender.
    pub async fn run_followups(self: Arc<Self>, mut rx: mpsc::Receiver<PacketMetadata>) {
        while let Some(synack) = rx.recv().await {
            if let Err(e) = self.follow_up(&synack) {
                warn!("Follow-up failed: {e:#}");
            }
        }
    }

    pub fn stats(&self) -> ProbeStats {
        ProbeStats {
            sent: self.sent.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            followups: self.followups.load(Ordering::Relaxed),
        }
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
