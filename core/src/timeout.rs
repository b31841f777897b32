//! # Timeout Queue
//!
//! Packets waiting on a further response are pushed here with a deadline one
//! retry interval away. The [`TimeoutWorker`] wakes at the earliest deadline
//! and either expires the connection or re-checks it through the classifier.
//!
//! Packets the worker re-schedules itself stay in its local heap instead of
//! going back through the channel, so the worker never waits on its own input.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use synack_common::network::packet::PacketMetadata;
use synack_common::record::{Outcome, ScanRecord};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::classifier::Classifier;
use crate::completion::CompletionSink;
use crate::engine::stopped;
use crate::state::StateTable;

#[derive(Debug)]
pub struct Scheduled {
    pub deadline: Instant,
    seq: u64,
    pub packet: PacketMetadata,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the std max-heap pops the earliest deadline first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Clone)]
pub struct TimeoutQueue {
    tx: mpsc::Sender<Scheduled>,
    interval: Duration,
}

impl TimeoutQueue {
    pub fn channel(capacity: usize, interval: Duration) -> (Self, mpsc::Receiver<Scheduled>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, interval }, rx)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn push(&self, packet: PacketMetadata) -> anyhow::Result<()> {
        trace!("Queued {} for re-check (counter {})", packet.identity(), packet.counter);
        let scheduled = Scheduled {
            deadline: Instant::now() + self.interval,
            seq: 0,
            packet,
        };
        self.tx.send(scheduled).await.context("timeout queue closed")
    }
}

/// What a due packet should become, decided under the state-table lock.
enum Due {
    Stale,
    Expired,
    Recheck,
}

pub struct TimeoutWorker {
    rx: mpsc::Receiver<Scheduled>,
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    interval: Duration,
    max_retries: u32,
    table: Arc<StateTable>,
    classifier: Arc<Classifier>,
    sink: CompletionSink,
}

impl TimeoutWorker {
    pub fn new(
        rx: mpsc::Receiver<Scheduled>,
        interval: Duration,
        max_retries: u32,
        table: Arc<StateTable>,
        classifier: Arc<Classifier>,
        sink: CompletionSink,
    ) -> Self {
        Self {
            rx,
            heap: BinaryHeap::new(),
            next_seq: 0,
            interval,
            max_retries,
            table,
            classifier,
            sink,
        }
    }

    /// Runs until `shutdown` fires. Entries still pending are abandoned; their
    /// state-table entries are accounted for by the engine's shutdown flush.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut open = true;
        loop {
            let head = self.heap.peek().map(|scheduled| scheduled.deadline);

            tokio::select! {
                _ = stopped(&mut shutdown) => break,

                received = self.rx.recv(), if open => match received {
                    Some(scheduled) => self.schedule(scheduled),
                    None => open = false,
                },

                _ = sleep_until(head), if head.is_some() => {
                    self.process_due().await?;
                }
            }

            if !open && self.heap.is_empty() {
                break;
            }
        }
        debug!("Timeout worker stopped with {} pending", self.heap.len());
        Ok(())
    }

    fn schedule(&mut self, mut scheduled: Scheduled) {
        scheduled.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(scheduled);
    }

    async fn process_due(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        while self.heap.peek().is_some_and(|scheduled| scheduled.deadline <= now) {
            let Some(scheduled) = self.heap.pop() else {
                break;
            };
            if let Some(packet) = self.on_due(scheduled.packet).await? {
                let deadline = Instant::now() + self.interval;
                self.schedule(Scheduled { deadline, seq: 0, packet });
            }
        }
        Ok(())
    }

    async fn on_due(&self, packet: PacketMetadata) -> anyhow::Result<Option<PacketMetadata>> {
        let identity = packet.identity();
        let due = {
            let mut entry = self.table.lock(identity);
            let expected = entry.get().map(|handshake| handshake.expected);
            match expected {
                None => Due::Stale,
                // The connection has moved on since this packet was queued.
                Some(expected) if expected != packet.expected => Due::Stale,
                Some(_) if packet.counter > self.max_retries => {
                    entry.remove();
                    Due::Expired
                }
                Some(_) => Due::Recheck,
            }
        };

        match due {
            Due::Stale => {
                trace!("Dropping stale timeout for {identity}");
                Ok(None)
            }
            Due::Expired => {
                debug!("{identity} expired after {} re-checks", packet.counter);
                self.sink.emit(ScanRecord::new(packet, Outcome::Expired)).await?;
                Ok(None)
            }
            Due::Recheck => {
                let step = self.classifier.recheck(packet);
                self.classifier.perform(step.action).await
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
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
