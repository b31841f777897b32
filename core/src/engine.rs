//! Wires the classifier, timeout worker and completion sink together and owns
//! their lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use synack_common::config::{Config, ShutdownPolicy};
use synack_common::network::packet::PacketMetadata;
use synack_common::record::{Outcome, ScanRecord};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, Transition};
use crate::completion::CompletionSink;
use crate::fingerprint::Fingerprinter;
use crate::network::PacketWriter;
use crate::state::StateTable;
use crate::teardown::{Teardown, TeardownStats};
use crate::timeout::{Scheduled, TimeoutQueue, TimeoutWorker};

/// Everything the engine talks to but does not own.
pub struct Collaborators {
    pub writer: Arc<dyn PacketWriter>,
    pub fingerprinter: Arc<dyn Fingerprinter>,
    /// Receives accepted handshakes so the prober can send its data.
    pub followup: Option<mpsc::Sender<PacketMetadata>>,
}

pub struct Engine {
    config: Config,
    table: Arc<StateTable>,
    timeouts: TimeoutQueue,
    timeout_rx: mpsc::Receiver<Scheduled>,
    sink: CompletionSink,
    classifier: Arc<Classifier>,
}

impl Engine {
    /// Builds the engine. The returned receiver yields every terminal record.
    pub fn new(config: &Config, collaborators: Collaborators) -> (Self, mpsc::Receiver<ScanRecord>) {
        let table = Arc::new(StateTable::new(config.shards));
        let (timeouts, timeout_rx) = TimeoutQueue::channel(config.queue_capacity, config.retry_interval);
        let (sink, records) = CompletionSink::channel(config.queue_capacity);

        let mut classifier = Classifier::new(
            table.clone(),
            timeouts.clone(),
            sink.clone(),
            Arc::new(Teardown::new(collaborators.writer)),
            collaborators.fingerprinter,
        );
        if let Some(followup) = collaborators.followup {
            classifier = classifier.with_followup(followup);
        }

        let engine = Self {
            config: config.clone(),
            table,
            timeouts,
            timeout_rx,
            sink,
            classifier: Arc::new(classifier),
        };
        (engine, records)
    }

    pub fn table(&self) -> Arc<StateTable> {
        self.table.clone()
    }

    pub fn timeouts(&self) -> TimeoutQueue {
        self.timeouts.clone()
    }

    /// Starts the classifier loop over `inbound` and the timeout worker.
    pub fn spawn(self, inbound: mpsc::Receiver<PacketMetadata>) -> EngineHandle {
        let (stop_classifier, classifier_shutdown) = watch::channel(false);
        let (stop_timeouts, timeout_shutdown) = watch::channel(false);

        let worker = TimeoutWorker::new(
            self.timeout_rx,
            self.config.retry_interval,
            self.config.max_retries,
            self.table.clone(),
            self.classifier.clone(),
            self.sink.clone(),
        );
        let timeout_task = tokio::spawn(worker.run(timeout_shutdown));
        let classifier_task = tokio::spawn(classify_loop(self.classifier.clone(), inbound, classifier_shutdown));

        info!(
            "Engine started (max retries {}, interval {:?})",
            self.config.max_retries, self.config.retry_interval
        );

        EngineHandle {
            stop_classifier,
            stop_timeouts,
            classifier_task,
            timeout_task,
            table: self.table,
            sink: self.sink,
            classifier: self.classifier,
            policy: self.config.shutdown_policy,
        }
    }
}

/// Resolves once `shutdown` reads true or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn classify_loop(
    classifier: Arc<Classifier>,
    mut inbound: mpsc::Receiver<PacketMetadata>,
    mut shutdown: watch::Receiver<bool>,
) -> HashMap<Transition, u64> {
    let mut transitions: HashMap<Transition, u64> = HashMap::new();
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,

            packet = inbound.recv() => match packet {
                Some(packet) => match classifier.handle(packet).await {
                    Ok(transition) => *transitions.entry(transition).or_default() += 1,
                    Err(e) => {
                        error!("Classifier stopped: {e:#}");
                        break;
                    }
                },
                None => {
                    debug!("Inbound queue closed");
                    break;
                }
            },
        }
    }
    transitions
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub transitions: HashMap<Transition, u64>,
    /// In-flight handshakes reported as incomplete.
    pub flushed: usize,
    /// In-flight handshakes discarded without a record.
    pub dropped: usize,
    pub resets: TeardownStats,
}

pub struct EngineHandle {
    stop_classifier: watch::Sender<bool>,
    stop_timeouts: watch::Sender<bool>,
    classifier_task: JoinHandle<HashMap<Transition, u64>>,
    timeout_task: JoinHandle<anyhow::Result<()>>,
    table: Arc<StateTable>,
    sink: CompletionSink,
    classifier: Arc<Classifier>,
    policy: ShutdownPolicy,
}

impl EngineHandle {
    /// Handshakes still waiting on a terminal response.
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Stops both loops and accounts for every handshake still in the table.
    ///
    /// The classifier is stopped and joined before the timeout worker, so
    /// every packet it requeues still reaches a live queue. The table is
    /// drained even if either task failed. Once this returns the engine holds
    /// no completion senders, so the record receiver ends after the last record.
    pub async fn shutdown(self) -> anyhow::Result<ShutdownReport> {
        self.stop_classifier.send_replace(true);
        let transitions = match self.classifier_task.await {
            Ok(transitions) => transitions,
            Err(e) => {
                warn!("Classifier task ended abnormally: {e}");
                HashMap::new()
            }
        };

        self.stop_timeouts.send_replace(true);
        match self.timeout_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Timeout worker stopped early: {e:#}"),
            Err(e) => warn!("Timeout worker ended abnormally: {e}"),
        }

        let remaining = self.table.drain();
        let mut report = ShutdownReport {
            transitions,
            resets: self.classifier.teardown().stats(),
            ..ShutdownReport::default()
        };

        match self.policy {
            ShutdownPolicy::Flush => {
                for handshake in remaining {
                    let record = ScanRecord::new(handshake.to_packet(), Outcome::Incomplete);
                    self.sink.emit(record).await?;
                    report.flushed += 1;
                }
                info!("Reported {} in-flight handshakes as incomplete", report.flushed);
            }
            ShutdownPolicy::Drop => {
                report.dropped = remaining.len();
                if report.dropped > 0 {
                    warn!("Dropped {} in-flight handshakes at shutdown", report.dropped);
                }
            }
        }

        Ok(report)
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
