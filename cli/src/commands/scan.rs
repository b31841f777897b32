use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use is_root::is_root;
use pnet::ipnetwork::IpNetwork;
use synack_common::config::Config;
use synack_common::network::filter::TargetFilter;
use synack_core::completion;
use synack_core::engine::{Collaborators, Engine, EngineHandle, ShutdownReport};
use synack_core::fingerprint::BannerFingerprinter;
use synack_core::network::capture;
use synack_core::prober::{ProbeConfig, ProbePayload, ProbeStatus, Prober};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::ScanArgs;
use crate::interface;
use crate::output::TerminalWriter;

const IDLE_POLL: Duration = Duration::from_millis(100);

pub async fn scan(args: ScanArgs) -> anyhow::Result<()> {
    if !is_root() {
        warn!("Not running as root; opening the capture channel will likely fail");
    }

    let cfg: Config = args.to_config();
    let filter = match TargetFilter::build(cfg.blocklist.as_deref()) {
        Ok(filter) => Arc::new(filter),
        Err(e) => {
            error!("Cannot load blocklist: {e}");
            return Err(e.into());
        }
    };

    let intf = interface::select(cfg.interface.as_deref())?;
    let link = interface::link_config(&intf, args.gateway_mac)?;
    let capture = capture::start_capture(&intf, cfg.source_ports(), cfg.queue_capacity)
        .context("starting packet capture")?;

    let (followup_tx, followup_rx) = mpsc::channel(cfg.queue_capacity);
    let (engine, records) = Engine::new(
        &cfg,
        Collaborators {
            writer: capture.writer.clone(),
            fingerprinter: Arc::new(BannerFingerprinter),
            followup: Some(followup_tx),
        },
    );

    let payload = match args.http {
        true => ProbePayload::Http,
        false => ProbePayload::Wait,
    };
    let prober = Arc::new(Prober::new(
        engine.table(),
        filter,
        capture.writer.clone(),
        engine.timeouts(),
        ProbeConfig {
            link,
            ports: cfg.source_ports(),
            payload,
        },
    ));

    let output = tokio::spawn(async move {
        let mut writer = TerminalWriter::stdout();
        completion::drain(records, &mut writer).await
    });
    let followups = tokio::spawn(prober.clone().run_followups(followup_rx));
    let handle = engine.spawn(capture.rx);

    let started = Instant::now();
    send_probes(&prober, &args.targets, &args.ports).await;
    wait_for_quiet(&handle, grace_period(&cfg)).await;

    let report = handle.shutdown().await?;
    followups.await.context("follow-up task panicked")?;
    let written = output.await.context("output task panicked")??;

    summarize(&report, written, prober.stats().blocked, started.elapsed());
    Ok(())
}

async fn send_probes(prober: &Prober, targets: &[IpNetwork], ports: &[u16]) {
    for network in targets {
        for addr in network.iter() {
            for port in ports {
                let target = SocketAddr::new(addr, *port);
                match prober.probe(target).await {
                    Ok(ProbeStatus::Unroutable) => warn!("No local address can reach {target}"),
                    Ok(_) => {}
                    Err(e) => warn!("Probe failed: {e:#}"),
                }
            }
        }
    }
    info!("Sent {} probes", prober.stats().sent);
}

/// Waiting for a SYN-ACK, then an ACK, then data. Each stage starts a fresh
/// retry budget.
const HANDSHAKE_STAGES: u32 = 3;

/// Long enough for a slow target to use up every retry at every stage, plus
/// one interval of slack.
fn grace_period(cfg: &Config) -> Duration {
    cfg.retry_interval * ((cfg.max_retries + 2) * HANDSHAKE_STAGES + 1)
}

async fn wait_for_quiet(handle: &EngineHandle, grace: Duration) {
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    loop {
        if handle.in_flight() == 0 {
            break;
        }
        tokio::select! {
            _ = &mut deadline => {
                info!("Grace period over with {} handshakes in flight", handle.in_flight());
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(IDLE_POLL) => {}
        }
    }
}

fn summarize(report: &ShutdownReport, written: usize, blocked: u64, elapsed: Duration) {
    info!(
        "Scan finished in {:.2}s: {} results, {} blocked, {} resets sent ({} failed)",
        elapsed.as_secs_f64(),
        written,
        blocked,
        report.resets.sent,
        report.resets.failed
    );
    if report.dropped > 0 {
        warn!("{} unfinished handshakes were not reported", report.dropped);
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
