use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pnet::ipnetwork::IpNetwork;
use synack_common::config::ShutdownPolicy;
use synack_common::network::filter::TargetFilter;
use synack_common::network::packet::{ScanIdentity, TcpFlags};
use synack_common::record::{CloseReason, Outcome};
use synack_core::network::capture::parse_frame;
use synack_core::network::PacketWriter;
use synack_core::prober::{LinkConfig, ProbeConfig, ProbePayload, ProbeStatus, Prober};
use tokio::sync::mpsc;

use crate::util::{self, RecordingWriter, Rig, LOCAL, REMOTE_SEQ, RETRY_INTERVAL};

const ISN: u32 = 9_000;
const SHORT: Duration = Duration::from_millis(50);

fn link() -> LinkConfig {
    LinkConfig {
        src_mac: util::local_mac(),
        gateway_mac: util::remote_mac(),
        local_v4: Some(LOCAL),
        local_v6: None,
    }
}

fn prober_for(rig: &Rig, filter: TargetFilter, payload: ProbePayload) -> Arc<Prober> {
    let writer: Arc<dyn PacketWriter> = rig.wire.clone();
    Arc::new(Prober::new(
        rig.table.clone(),
        Arc::new(filter),
        writer,
        rig.timeouts.clone(),
        ProbeConfig {
            link: link(),
            ports: 40_000..=40_099,
            payload,
        },
    ))
}

#[tokio::test(start_paused = true)]
async fn full_handshake_ends_in_one_data_record() {
    let cfg = util::config(2, ShutdownPolicy::Flush);
    let (followup_tx, followup_rx) = mpsc::channel(16);
    let mut rig = Rig::start_with_followup(&cfg, RecordingWriter::default(), Some(followup_tx));
    let prober = prober_for(&rig, TargetFilter::empty(), ProbePayload::Http);
    tokio::spawn(prober.clone().run_followups(followup_rx));

    let target: SocketAddr = "198.51.100.50:80".parse().unwrap();
    assert_eq!(prober.probe(target).await.unwrap(), ProbeStatus::Sent);

    let syn = parse_frame(&rig.wire.frames()[0]).unwrap();
    assert!(syn.flags.syn);
    let id = ScanIdentity {
        remote_addr: syn.dst_addr,
        remote_port: syn.dst_port,
        local_addr: syn.src_addr,
        local_port: syn.src_port,
    };

    rig.send(util::synack(id, syn.seq)).await;
    util::settle().await;

    let followup = parse_frame(&rig.wire.frames()[1]).unwrap();
    assert!(followup.flags.ack && followup.flags.psh);
    assert_eq!(followup.ack, REMOTE_SEQ + 1);
    let sent = followup.payload.len() as u32;
    assert_eq!(rig.table.get(id).unwrap().sent_len, sent);

    let reply = util::inbound(id, TcpFlags::ACK | TcpFlags::PSH, REMOTE_SEQ + 1, syn.seq.wrapping_add(1 + sent))
        .with_payload(b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec());
    rig.send(reply.clone()).await;

    let record = rig.next_record(SHORT).await.unwrap();
    assert_eq!(record.outcome, Outcome::Data { fingerprint: "http".to_string() });
    assert_eq!(rig.handle.in_flight(), 0);

    // A retransmitted reply no longer matches any state and is never reported.
    rig.send(reply).await;
    assert!(rig.next_record(RETRY_INTERVAL * 6).await.is_none());

    let report = rig.handle.shutdown().await.unwrap();
    assert_eq!(report.flushed, 0);
}

#[tokio::test(start_paused = true)]
async fn silent_target_expires_once_retries_run_out() {
    let cfg = util::config(1, ShutdownPolicy::Flush);
    let mut rig = Rig::start(&cfg, RecordingWriter::default());
    let prober = prober_for(&rig, TargetFilter::empty(), ProbePayload::Wait);

    prober.probe("198.51.100.51:443".parse().unwrap()).await.unwrap();
    assert_eq!(rig.handle.in_flight(), 1);

    assert!(rig.next_record(RETRY_INTERVAL).await.is_none());
    let record = rig.next_record(RETRY_INTERVAL * 4).await.unwrap();
    assert_eq!(record.outcome, Outcome::Expired);
    assert_eq!(record.packet.counter, 2);
    assert_eq!(rig.handle.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn blocked_targets_never_reach_the_wire() {
    let rig = Rig::start(&util::config(1, ShutdownPolicy::Flush), RecordingWriter::default());
    let mut filter = TargetFilter::empty();
    filter.insert("198.51.100.0/24".parse::<IpNetwork>().unwrap());
    let prober = prober_for(&rig, filter, ProbePayload::Wait);

    let status = prober.probe("198.51.100.52:80".parse().unwrap()).await.unwrap();
    assert_eq!(status, ProbeStatus::Blocked);
    assert!(rig.wire.is_empty());
    assert_eq!(rig.handle.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_failures_do_not_stop_the_engine() {
    let mut rig = Rig::start(&util::config(1, ShutdownPolicy::Flush), RecordingWriter::failing());
    let first = util::identity(60, 21);
    let second = util::identity(61, 21);
    rig.register(first, ISN);
    rig.register(second, ISN);

    rig.send(util::inbound(first, TcpFlags::FIN | TcpFlags::ACK, REMOTE_SEQ, ISN + 1)).await;
    rig.send(util::inbound(second, TcpFlags::FIN | TcpFlags::ACK, REMOTE_SEQ, ISN + 1)).await;

    for _ in 0..2 {
        let record = rig.next_record(SHORT).await.unwrap();
        assert_eq!(record.outcome, Outcome::Closed(CloseReason::Fin));
    }

    let report = rig.handle.shutdown().await.unwrap();
    assert_eq!(report.resets.failed, 2);
    assert_eq!(report.resets.sent, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_flush_reports_every_open_handshake() {
    let rig = Rig::start(&util::config(5, ShutdownPolicy::Flush), RecordingWriter::default());
    for octet in 70..75 {
        rig.register(util::identity(octet, 80), ISN);
    }

    let Rig { handle, mut records, .. } = rig;
    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.flushed, 5);

    let mut incomplete = 0;
    while let Some(record) = records.recv().await {
        assert_eq!(record.outcome, Outcome::Incomplete);
        incomplete += 1;
    }
    assert_eq!(incomplete, 5);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drop_discards_open_handshakes() {
    let rig = Rig::start(&util::config(5, ShutdownPolicy::Drop), RecordingWriter::default());
    rig.register(util::identity(80, 80), ISN);
    rig.register(util::identity(81, 80), ISN);

    let Rig { handle, mut records, table, .. } = rig;
    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.dropped, 2);
    assert!(table.is_empty());
    assert!(records.recv().await.is_none());
}
