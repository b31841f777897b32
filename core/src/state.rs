//! # Connection State Table
//!
//! One [`Handshake`] per in-flight probe, keyed by [`ScanIdentity`]. The map
//! is split across independently locked shards; all reads and writes for a
//! given identity go through a [`StateEntry`] guard, so verification and the
//! mutation that follows it are a single atomic step.

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use synack_common::network::packet::{ExpectedResponse, PacketMetadata, ScanIdentity};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanState {
    AwaitingVerification,
    AwaitingData,
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub identity: ScanIdentity,
    /// Our initial sequence number.
    pub isn: u32,
    /// Bytes of probe data sent after the handshake.
    pub sent_len: u32,
    /// Next sequence number expected from the remote, once its SYN is seen.
    pub remote_next: Option<u32>,
    pub state: ScanState,
    pub expected: ExpectedResponse,
    pub retries: u32,
    pub created_at: Instant,
    pub updated_at: Instant,
}

impl Handshake {
    pub fn new(identity: ScanIdentity, isn: u32) -> Self {
        let now = Instant::now();
        Self {
            identity,
            isn,
            sent_len: 0,
            remote_next: None,
            state: ScanState::AwaitingVerification,
            expected: ExpectedResponse::SynAck,
            retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `packet` is a plausible response to this handshake.
    pub fn verifies(&self, packet: &PacketMetadata) -> bool {
        if packet.identity() != self.identity {
            return false;
        }
        let flags = packet.flags;
        let first = self.isn.wrapping_add(1);

        if flags.syn && flags.ack {
            return packet.ack == first;
        }
        if flags.rst && !flags.ack {
            return self.remote_next == Some(packet.seq);
        }

        let acked = packet.ack.wrapping_sub(first);
        if acked > self.sent_len {
            return false;
        }
        match self.remote_next {
            Some(next) => packet.seq == next,
            None => true,
        }
    }

    /// A placeholder packet used to report this handshake when it never finished.
    pub fn to_packet(&self) -> PacketMetadata {
        let mut packet = PacketMetadata::awaiting(self.identity);
        packet.expected = self.expected;
        packet.counter = self.retries;
        packet
    }
}

/// Exclusive access to one identity's slot in the table.
pub struct StateEntry<'a> {
    identity: ScanIdentity,
    shard: MutexGuard<'a, HashMap<ScanIdentity, Handshake>>,
}

impl StateEntry<'_> {
    pub fn get(&self) -> Option<&Handshake> {
        self.shard.get(&self.identity)
    }

    pub fn verify(&self, packet: &PacketMetadata) -> bool {
        self.get().is_some_and(|handshake| handshake.verifies(packet))
    }

    /// Inserts or refreshes the handshake from an observed packet.
    pub fn update(&mut self, packet: &PacketMetadata) {
        let identity = self.identity;
        let handshake = self
            .shard
            .entry(identity)
            .or_insert_with(|| Handshake::new(identity, packet.ack.wrapping_sub(1)));

        if packet.flags.syn && packet.flags.ack {
            handshake.remote_next = Some(packet.seq.wrapping_add(1));
        }
        handshake.expected = packet.expected;
        if packet.expected == ExpectedResponse::Data {
            handshake.state = ScanState::AwaitingData;
        }
        handshake.retries = handshake.retries.max(packet.counter);
        handshake.updated_at = Instant::now();
        trace!("Updated state for {identity}: {:?}", handshake.state);
    }

    pub fn remove(&mut self) -> Option<Handshake> {
        self.shard.remove(&self.identity)
    }

    /// Consumes one retry. Returns the new count, or `None` when absent.
    pub fn retry(&mut self) -> Option<u32> {
        let handshake = self.shard.get_mut(&self.identity)?;
        handshake.retries = handshake.retries.saturating_add(1);
        handshake.updated_at = Instant::now();
        Some(handshake.retries)
    }

    pub fn record_probe(&mut self, sent_len: u32) -> bool {
        match self.shard.get_mut(&self.identity) {
            Some(handshake) => {
                handshake.sent_len = sent_len;
                handshake.updated_at = Instant::now();
                true
            }
            None => false,
        }
    }
}

pub struct StateTable {
    shards: Vec<Mutex<HashMap<ScanIdentity, Handshake>>>,
    hasher: RandomState,
}

impl StateTable {
    pub fn new(shards: usize) -> Self {
        let count = shards.max(1);
        Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    pub fn lock(&self, identity: ScanIdentity) -> StateEntry<'_> {
        let index = (self.hasher.hash_one(identity) % self.shards.len() as u64) as usize;
        let shard = self.shards[index].lock().unwrap_or_else(PoisonError::into_inner);
        StateEntry { identity, shard }
    }

    pub fn register(&self, handshake: Handshake) {
        let identity = handshake.identity;
        let mut entry = self.lock(identity);
        entry.shard.insert(identity, handshake);
    }

    pub fn verify_scanning_ip(&self, packet: &PacketMetadata) -> bool {
        self.lock(packet.identity()).verify(packet)
    }

    pub fn update(&self, packet: &PacketMetadata) {
        self.lock(packet.identity()).update(packet);
    }

    pub fn remove(&self, identity: ScanIdentity) -> Option<Handshake> {
        self.lock(identity).remove()
    }

    pub fn record_probe(&self, identity: ScanIdentity, sent_len: u32) -> bool {
        self.lock(identity).record_probe(sent_len)
    }

    pub fn contains(&self, identity: ScanIdentity) -> bool {
        self.lock(identity).get().is_some()
    }

    pub fn get(&self, identity: ScanIdentity) -> Option<Handshake> {
        self.lock(identity).get().cloned()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every remaining handshake.
    pub fn drain(&self) -> Vec<Handshake> {
        self.shards
            .iter()
            .flat_map(|shard| {
                let mut map = shard.lock().unwrap_or_else(PoisonError::into_inner);
                map.drain().map(|(_, handshake)| handshake).collect::<Vec<_>>()
            })
            .collect()
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use synack_common::network::packet::TcpFlags;

    const ISN: u32 = 1_000;

    fn identity() -> ScanIdentity {
        ScanIdentity {
            remote_addr: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 10)),
            remote_port: 80,
            local_addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            local_port: 40_000,
        }
    }

    fn response(flags: u8, seq: u32, ack: u32) -> PacketMetadata {
        PacketMetadata::awaiting(identity())
            .with_flags(flags)
            .with_sequence(seq, ack)
    }

    fn table_with_handshake() -> StateTable {
        let table = StateTable::new(4);
        table.register(Handshake::new(identity(), ISN));
        table
    }

    #[test]
    fn synack_must_acknowledge_isn() {
        let table = table_with_handshake();
        assert!(table.verify_scanning_ip(&response(TcpFlags::SYN | TcpFlags::ACK, 5_000, ISN + 1)));
        assert!(!table.verify_scanning_ip(&response(TcpFlags::SYN | TcpFlags::ACK, 5_000, ISN + 2)));
    }

    #[test]
    fn unknown_identity_never_verifies() {
        let table = StateTable::new(4);
        assert!(!table.verify_scanning_ip(&response(TcpFlags::SYN | TcpFlags::ACK, 5_000, ISN + 1)));
    }

    #[test]
    fn verification_does_not_mutate() {
        let table = table_with_handshake();
        let before = table.get(identity()).unwrap();
        table.verify_scanning_ip(&response(TcpFlags::ACK, 5_001, ISN + 1));
        let after = table.get(identity()).unwrap();
        assert_eq!(before.retries, after.retries);
        assert_eq!(before.remote_next, after.remote_next);
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[test]
    fn synack_update_learns_remote_sequence() {
        let table = table_with_handshake();
        let mut synack = response(TcpFlags::SYN | TcpFlags::ACK, 5_000, ISN + 1);
        synack.update_response(ExpectedResponse::Ack);
        table.update(&synack);

        let handshake = table.get(identity()).unwrap();
        assert_eq!(handshake.remote_next, Some(5_001));
        assert_eq!(handshake.expected, ExpectedResponse::Ack);

        assert!(table.verify_scanning_ip(&response(TcpFlags::ACK, 5_001, ISN + 1)));
        assert!(!table.verify_scanning_ip(&response(TcpFlags::ACK, 9_999, ISN + 1)));
    }

    #[test]
    fn bare_rst_needs_known_remote_sequence() {
        let table = table_with_handshake();
        assert!(!table.verify_scanning_ip(&response(TcpFlags::RST, 5_001, 0)));

        table.update(&response(TcpFlags::SYN | TcpFlags::ACK, 5_000, ISN + 1));
        assert!(table.verify_scanning_ip(&response(TcpFlags::RST, 5_001, 0)));
    }

    #[test]
    fn ack_window_covers_sent_probe() {
        let table = table_with_handshake();
        table.update(&response(TcpFlags::SYN | TcpFlags::ACK, 5_000, ISN + 1));
        assert!(table.record_probe(identity(), 18));

        assert!(table.verify_scanning_ip(&response(TcpFlags::ACK, 5_001, ISN + 1 + 18)));
        assert!(!table.verify_scanning_ip(&response(TcpFlags::ACK, 5_001, ISN + 1 + 19)));
        assert!(!table.verify_scanning_ip(&response(TcpFlags::ACK, 5_001, ISN)));
    }

    #[test]
    fn ack_window_wraps_around_sequence_space() {
        let table = StateTable::new(1);
        table.register(Handshake::new(identity(), u32::MAX));
        assert!(table.verify_scanning_ip(&response(TcpFlags::SYN | TcpFlags::ACK, 1, 0)));
    }

    #[test]
    fn update_inserts_missing_entry() {
        let table = StateTable::new(2);
        let mut packet = response(TcpFlags::ACK, 5_001, ISN + 1);
        packet.update_response(ExpectedResponse::Data);
        packet.counter = 2;
        table.update(&packet);

        let handshake = table.get(identity()).unwrap();
        assert_eq!(handshake.isn, ISN);
        assert_eq!(handshake.state, ScanState::AwaitingData);
        assert_eq!(handshake.retries, 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let table = table_with_handshake();
        assert!(table.remove(identity()).is_some());
        assert!(table.remove(identity()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn retry_counts_only_present_entries() {
        let table = table_with_handshake();
        assert_eq!(table.lock(identity()).retry(), Some(1));
        assert_eq!(table.lock(identity()).retry(), Some(2));
        table.remove(identity());
        assert_eq!(table.lock(identity()).retry(), None);
    }

    #[test]
    fn drain_empties_every_shard() {
        let table = StateTable::new(8);
        for port in 0..32u16 {
            let mut id = identity();
            id.local_port = 40_000 + port;
            table.register(Handshake::new(id, ISN));
        }
        assert_eq!(table.len(), 32);
        assert_eq!(table.drain().len(), 32);
        assert!(table.is_empty());
    }

    #[test]
    fn same_key_updates_are_serialized() {
        let table = Arc::new(table_with_handshake());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        table.lock(identity()).retry();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.get(identity()).unwrap().retries, 2_000);
    }
}
