use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use synack_common::network::packet::{PacketMetadata, TcpFlags};
use tracing::{trace, warn};

use crate::network::tcp::{self, Segment};
use crate::network::{PacketError, PacketWriter};

/// Builds the RST|ACK frame that tears down the connection `packet` belongs to.
pub fn construct_reset(packet: &PacketMetadata) -> Result<Vec<u8>, PacketError> {
    let consumed = packet.payload.len() as u32 + u32::from(packet.flags.fin);
    let segment = Segment {
        src_mac: packet.dst_mac,
        dst_mac: packet.src_mac,
        src_addr: packet.dst_addr,
        dst_addr: packet.src_addr,
        src_port: packet.dst_port,
        dst_port: packet.src_port,
        seq: packet.ack,
        ack: packet.seq.wrapping_add(consumed),
        flags: TcpFlags::from_bits(TcpFlags::RST | TcpFlags::ACK),
        window: 0,
        payload: &[],
    };
    tcp::build_frame(&segment)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownStats {
    pub sent: u64,
    pub failed: u64,
}

pub struct Teardown {
    writer: Arc<dyn PacketWriter>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Teardown {
    pub fn new(writer: Arc<dyn PacketWriter>) -> Self {
        Self {
            writer,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn construct(&self, packet: &PacketMetadata) -> Option<Vec<u8>> {
        match construct_reset(packet) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Could not build reset for {}: {e}", packet.identity());
                self.failed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Sends a prepared reset. Failures are counted and logged, never returned.
    pub fn transmit(&self, frame: &[u8]) {
        match self.writer.write_packet_data(frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                trace!("Reset sent ({} bytes)", frame.len());
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send reset: {e}");
            }
        }
    }

    pub fn stats(&self) -> TeardownStats {
        TeardownStats {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
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
