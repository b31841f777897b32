//! Terminal results of a scan, as handed to the completion sink.

use std::fmt;
use std::time::SystemTime;

use crate::network::packet::{PacketMetadata, ScanIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Rst,
    Fin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The remote sent application data.
    Data { fingerprint: String },
    /// The remote closed the connection before sending data.
    Closed(CloseReason),
    /// The retry budget ran out without a terminal response.
    Expired,
    /// The engine shut down while the handshake was still in flight.
    Incomplete,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Data { .. } => "data",
            Outcome::Closed(CloseReason::Rst) => "rst",
            Outcome::Closed(CloseReason::Fin) => "fin",
            Outcome::Expired => "expired",
            Outcome::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Data { fingerprint } => write!(f, "data ({fingerprint})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub packet: PacketMetadata,
    pub outcome: Outcome,
    pub completed_at: SystemTime,
}

impl ScanRecord {
    pub fn new(packet: PacketMetadata, outcome: Outcome) -> Self {
        Self {
            packet,
            outcome,
            completed_at: SystemTime::now(),
        }
    }

    pub fn identity(&self) -> ScanIdentity {
        self.packet.identity()
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
