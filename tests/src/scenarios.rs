use std::io::Cursor;
use std::net::IpAddr;
use std::time::Duration;

use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use synack_common::config::ShutdownPolicy;
use synack_common::network::filter::TargetFilter;
use synack_common::network::packet::{ExpectedResponse, TcpFlags};
use synack_common::record::{CloseReason, Outcome};
use synack_core::state::ScanState;

use crate::util::{self, RecordingWriter, Rig, REMOTE_SEQ, RETRY_INTERVAL};

const ISN: u32 = 1_000;
const SHORT: Duration = Duration::from_millis(50);

fn reset_fields(frame: &[u8]) -> (u32, u32, u8) {
    let eth = EthernetPacket::new(frame).unwrap();
    let ip = Ipv4Packet::new(eth.payload()).unwrap();
    let tcp = TcpPacket::new(ip.payload()).unwrap();
    let flags = (u16::from(tcp.get_flags()) & 0xff) as u8;
    (tcp.get_sequence(), tcp.get_acknowledgement(), flags)
}

#[test]
fn nested_blocklist_entries_collapse() {
    let list = "10.0.0.0/8\n10.1.2.0/24\n";
    let filter = TargetFilter::from_reader(Cursor::new(list)).unwrap();

    assert_eq!(filter.len(), 1);
    assert!(filter.is_blocked("10.1.2.3".parse::<IpAddr>().unwrap()));
    assert!(filter.is_blocked("10.200.0.1".parse::<IpAddr>().unwrap()));
    assert!(!filter.is_blocked("11.0.0.1".parse::<IpAddr>().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn unverified_synack_keeps_state_and_retries() {
    let mut rig = Rig::start(&util::config(1, ShutdownPolicy::Flush), RecordingWriter::default());
    let id = util::identity(2, 80);
    rig.register(id, ISN);

    rig.send(util::synack(id, ISN + 41)).await;

    assert!(rig.table.contains(id));
    assert!(rig.next_record(SHORT).await.is_none());
    assert!(rig.wire.is_empty());

    // The bogus packet is re-checked until it runs out of retries.
    let record = rig.next_record(RETRY_INTERVAL * 4).await.unwrap();
    assert_eq!(record.outcome, Outcome::Expired);
    assert!(record.packet.validation_failed);
    assert!(record.packet.counter > 1);
    assert!(!rig.table.contains(id));
}

#[tokio::test(start_paused = true)]
async fn verified_data_completes_with_fingerprint_and_reset() {
    let mut rig = Rig::start(&util::config(1, ShutdownPolicy::Flush), RecordingWriter::default());
    let id = util::identity(3, 80);
    rig.register(id, ISN);

    let data = util::inbound(id, TcpFlags::ACK | TcpFlags::PSH, REMOTE_SEQ, ISN + 1)
        .with_payload(b"HTTP/1.1 200 OK\r\nServer: test\r\n\r\n0123456789abcdefg".to_vec());
    assert_eq!(data.payload.len(), 50);
    rig.send(data).await;

    let record = rig.next_record(SHORT).await.unwrap();
    assert_eq!(record.outcome, Outcome::Data { fingerprint: "http".to_string() });
    assert!(!rig.table.contains(id));

    let frames = rig.wire.frames();
    assert_eq!(frames.len(), 1);
    let (seq, ack, flags) = reset_fields(&frames[0]);
    assert_eq!(seq, ISN + 1);
    assert_eq!(ack, REMOTE_SEQ + 50);
    assert_eq!(flags, TcpFlags::RST | TcpFlags::ACK);
}

#[tokio::test(start_paused = true)]
async fn verified_fin_is_recorded_and_reset() {
    let mut rig = Rig::start(&util::config(1, ShutdownPolicy::Flush), RecordingWriter::default());
    let id = util::identity(4, 443);
    rig.register(id, ISN);

    rig.send(util::inbound(id, TcpFlags::FIN | TcpFlags::ACK, REMOTE_SEQ, ISN + 1)).await;

    let record = rig.next_record(SHORT).await.unwrap();
    assert_eq!(record.outcome, Outcome::Closed(CloseReason::Fin));
    assert!(!rig.table.contains(id));

    let frames = rig.wire.frames();
    assert_eq!(frames.len(), 1);
    let (_, ack, _) = reset_fields(&frames[0]);
    assert_eq!(ack, REMOTE_SEQ + 1);
}

#[tokio::test(start_paused = true)]
async fn verified_rst_is_recorded_without_reset() {
    let mut rig = Rig::start(&util::config(1, ShutdownPolicy::Flush), RecordingWriter::default());
    let id = util::identity(5, 25);
    rig.register(id, ISN);

    rig.send(util::inbound(id, TcpFlags::RST | TcpFlags::ACK, 0, ISN + 1)).await;

    let record = rig.next_record(SHORT).await.unwrap();
    assert_eq!(record.outcome, Outcome::Closed(CloseReason::Rst));
    assert!(rig.wire.is_empty());
}

#[tokio::test(start_paused = true)]
async fn bare_ack_waits_for_data() {
    let mut rig = Rig::start(&util::config(3, ShutdownPolicy::Flush), RecordingWriter::default());
    let id = util::identity(6, 22);
    rig.register(id, ISN);

    rig.send(util::inbound(id, TcpFlags::ACK, REMOTE_SEQ, ISN + 1)).await;

    let handshake = rig.table.get(id).unwrap();
    assert_eq!(handshake.state, ScanState::AwaitingData);
    assert_eq!(handshake.expected, ExpectedResponse::Data);
    assert!(rig.next_record(SHORT).await.is_none());

    let banner = util::inbound(id, TcpFlags::ACK | TcpFlags::PSH, REMOTE_SEQ, ISN + 1)
        .with_payload(b"SSH-2.0-OpenSSH_9.6\r\n".to_vec());
    rig.send(banner).await;

    let record = rig.next_record(SHORT).await.unwrap();
    assert_eq!(record.outcome, Outcome::Data { fingerprint: "ssh".to_string() });
    assert!(rig.table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stray_synack_cannot_expire_a_progressed_handshake() {
    let mut rig = Rig::start(&util::config(1, ShutdownPolicy::Flush), RecordingWriter::default());
    let id = util::identity(7, 443);
    rig.register(id, ISN);

    rig.send(util::synack(id, ISN + 41)).await;
    tokio::time::sleep(RETRY_INTERVAL / 2).await;
    rig.send(util::synack(id, ISN)).await;
    assert_eq!(rig.table.get(id).unwrap().expected, ExpectedResponse::Ack);

    // Past the point where the stray packet would have run out of retries.
    assert!(rig.next_record(RETRY_INTERVAL * 2).await.is_none());
    assert!(rig.table.contains(id));

    let record = rig.next_record(RETRY_INTERVAL * 4).await.unwrap();
    assert_eq!(record.outcome, Outcome::Expired);
    assert!(!record.packet.validation_failed);
    assert_eq!(record.packet.expected, ExpectedResponse::Ack);
}
