//! Raw packet plumbing shared by the engine and the prober.

pub mod capture;
pub mod tcp;

use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("buffer too small for {0} header")]
    Buffer(&'static str),
    #[error("cannot build a segment from {src} to {dst}: address families differ")]
    FamilyMismatch { src: IpAddr, dst: IpAddr },
}

/// Raw send primitive for fully formed link-layer frames.
///
/// Injected into every component that transmits, so nothing reaches for a
/// global capture handle.
pub trait PacketWriter: Send + Sync {
    fn write_packet_data(&self, frame: &[u8]) -> std::io::Result<()>;
}
