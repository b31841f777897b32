use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pnet::util::MacAddr;
use synack_common::config::{Config, ShutdownPolicy};
use synack_common::network::packet::{PacketMetadata, ScanIdentity, TcpFlags};
use synack_common::record::ScanRecord;
use synack_core::engine::{Collaborators, Engine, EngineHandle};
use synack_core::fingerprint::BannerFingerprinter;
use synack_core::network::PacketWriter;
use synack_core::state::{Handshake, StateTable};
use synack_core::timeout::TimeoutQueue;
use tokio::sync::mpsc;

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
pub const REMOTE_SEQ: u32 = 70_000;
pub const RETRY_INTERVAL: Duration = Duration::from_millis(500);

pub fn local_mac() -> MacAddr {
    MacAddr::new(0x02, 0, 0, 0, 0, 0x01)
}

pub fn remote_mac() -> MacAddr {
    MacAddr::new(0x02, 0, 0, 0, 0, 0xfe)
}

/// Frames handed to the wire, kept for inspection.
#[derive(Default)]
pub struct RecordingWriter {
    frames: Mutex<Vec<Vec<u8>>>,
    failing: AtomicBool,
}

impl RecordingWriter {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketWriter for RecordingWriter {
    fn write_packet_data(&self, frame: &[u8]) -> io::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "wire unplugged"));
        }
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

pub fn identity(remote_last_octet: u8, remote_port: u16) -> ScanIdentity {
    ScanIdentity {
        remote_addr: IpAddr::V4(Ipv4Addr::new(198, 51, 100, remote_last_octet)),
        remote_port,
        local_addr: IpAddr::V4(LOCAL),
        local_port: 40_000,
    }
}

/// A packet from the remote side of `identity`.
pub fn inbound(identity: ScanIdentity, flags: u8, seq: u32, ack: u32) -> PacketMetadata {
    PacketMetadata::awaiting(identity)
        .with_flags(flags)
        .with_sequence(seq, ack)
        .with_macs(remote_mac(), local_mac())
}

pub fn synack(identity: ScanIdentity, isn: u32) -> PacketMetadata {
    inbound(identity, TcpFlags::SYN | TcpFlags::ACK, REMOTE_SEQ, isn.wrapping_add(1))
}

pub fn config(max_retries: u32, policy: ShutdownPolicy) -> Config {
    Config {
        max_retries,
        retry_interval: RETRY_INTERVAL,
        queue_capacity: 256,
        shards: 8,
        shutdown_policy: policy,
        ..Config::default()
    }
}

/// A running engine with its inputs and outputs exposed.
pub struct Rig {
    pub inbound: mpsc::Sender<PacketMetadata>,
    pub records: mpsc::Receiver<ScanRecord>,
    pub table: Arc<StateTable>,
    pub wire: Arc<RecordingWriter>,
    /// The engine's timeout queue, shared with probers under test.
    pub timeouts: TimeoutQueue,
    pub handle: EngineHandle,
}

impl Rig {
    pub fn start(cfg: &Config, wire: RecordingWriter) -> Self {
        Self::start_with_followup(cfg, wire, None)
    }

    pub fn start_with_followup(
        cfg: &Config,
        wire: RecordingWriter,
        followup: Option<mpsc::Sender<PacketMetadata>>,
    ) -> Self {
        let wire = Arc::new(wire);
        let (engine, records) = Engine::new(
            cfg,
            Collaborators {
                writer: wire.clone(),
                fingerprinter: Arc::new(BannerFingerprinter),
                followup,
            },
        );
        let table = engine.table();
        let timeouts = engine.timeouts();
        let (inbound, rx) = mpsc::channel(cfg.queue_capacity);
        let handle = engine.spawn(rx);
        Self {
            inbound,
            records,
            table,
            wire,
            timeouts,
            handle,
        }
    }

    pub fn register(&self, identity: ScanIdentity, isn: u32) {
        self.table.register(Handshake::new(identity, isn));
    }

    pub async fn send(&self, packet: PacketMetadata) {
        self.inbound.send(packet).await.unwrap();
        settle().await;
    }

    /// The next record, if one arrives within `wait`.
    pub async fn next_record(&mut self, wait: Duration) -> Option<ScanRecord> {
        tokio::time::timeout(wait, self.records.recv()).await.ok().flatten()
    }
}

/// Lets every spawned task run until it blocks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
