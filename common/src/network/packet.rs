//! # Packet Model
//!
//! [`PacketMetadata`] is the parsed shape of one TCP segment observed on the
//! wire (or synthesized by the prober while it waits for one). Addresses are
//! always stored as seen on the packet, so for an inbound response the
//! *source* is the scanned host.

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use pnet::util::MacAddr;

/// The address/port tuple identifying one in-flight probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanIdentity {
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub local_addr: IpAddr,
    pub local_port: u16,
}

impl fmt::Display for ScanIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr {
            IpAddr::V4(addr) => write!(f, "{addr}:{}", self.remote_port),
            IpAddr::V6(addr) => write!(f, "[{addr}]:{}", self.remote_port),
        }
    }
}

/// The next response the scanner is waiting for on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExpectedResponse {
    #[default]
    SynAck,
    Ack,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const SYN: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;
    pub const PSH: u8 = 0b0000_1000;
    pub const ACK: u8 = 0b0001_0000;

    pub fn from_bits(bits: u8) -> Self {
        Self {
            fin: bits & Self::FIN != 0,
            syn: bits & Self::SYN != 0,
            rst: bits & Self::RST != 0,
            psh: bits & Self::PSH != 0,
            ack: bits & Self::ACK != 0,
        }
    }

    pub fn bits(&self) -> u8 {
        [
            (self.fin, Self::FIN),
            (self.syn, Self::SYN),
            (self.rst, Self::RST),
            (self.psh, Self::PSH),
            (self.ack, Self::ACK),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }
}

#[derive(Debug, Clone)]
pub struct PacketMetadata {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub ttl: u8,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
    /// Number of times this packet has been re-checked. Never decreases.
    pub counter: u32,
    pub timestamp: Instant,
    pub validation_failed: bool,
    pub expected: ExpectedResponse,
    /// Only set once data has been received.
    pub fingerprint: Option<String>,
}

impl PacketMetadata {
    pub fn new(src_addr: IpAddr, src_port: u16, dst_addr: IpAddr, dst_port: u16) -> Self {
        Self {
            src_mac: MacAddr::zero(),
            dst_mac: MacAddr::zero(),
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            seq: 0,
            ack: 0,
            window: 0,
            ttl: 0,
            flags: TcpFlags::default(),
            payload: Vec::new(),
            counter: 0,
            timestamp: Instant::now(),
            validation_failed: false,
            expected: ExpectedResponse::default(),
            fingerprint: None,
        }
    }

    /// A placeholder standing in for the response a freshly sent probe is
    /// waiting on. It carries no flags, so it never matches a handshake.
    pub fn awaiting(identity: ScanIdentity) -> Self {
        Self::new(
            identity.remote_addr,
            identity.remote_port,
            identity.local_addr,
            identity.local_port,
        )
    }

    pub fn with_flags(mut self, bits: u8) -> Self {
        self.flags = TcpFlags::from_bits(bits);
        self
    }

    pub fn with_sequence(mut self, seq: u32, ack: u32) -> Self {
        self.seq = seq;
        self.ack = ack;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_macs(mut self, src_mac: MacAddr, dst_mac: MacAddr) -> Self {
        self.src_mac = src_mac;
        self.dst_mac = dst_mac;
        self
    }

    /// Identity of the probe this packet answers; the remote end is the sender.
    pub fn identity(&self) -> ScanIdentity {
        ScanIdentity {
            remote_addr: self.src_addr,
            remote_port: self.src_port,
            local_addr: self.dst_addr,
            local_port: self.dst_port,
        }
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn increment_counter(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }

    pub fn update_timestamp(&mut self) {
        self.timestamp = Instant::now();
    }

    pub fn mark_validation_failed(&mut self) {
        self.validation_failed = true;
    }

    pub fn update_response(&mut self, expected: ExpectedResponse) {
        self.expected = expected;
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
