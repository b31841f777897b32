//! # Packet Classifier
//!
//! Decides what an inbound packet means for its connection and carries out the
//! consequences. The decision itself is [`classify`], a pure function over a
//! priority-ordered table of predicates. [`Classifier::apply`] runs it under the
//! state-table lock for the packet's identity, so verification and the state
//! mutation it leads to can't interleave with another packet for the same
//! connection. Side effects that leave the engine (records, resets, follow-up
//! probes) are described by an [`Action`] and performed afterwards, in the
//! order table, then queue, then wire.

use std::sync::Arc;

use synack_common::network::packet::{ExpectedResponse, PacketMetadata};
use synack_common::record::{CloseReason, Outcome, ScanRecord};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::completion::CompletionSink;
use crate::fingerprint::Fingerprinter;
use crate::state::StateTable;
use crate::teardown::Teardown;
use crate::timeout::TimeoutQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    VerificationFailed,
    DataReceived,
    ConnectionClosed,
    AwaitingData,
    HandshakeAccepted,
    Ignored,
}

type Rule = (Transition, fn(bool, &PacketMetadata) -> bool);

static RULES: &[Rule] = &[
    (Transition::VerificationFailed, failed_verification),
    (Transition::DataReceived, carries_data),
    (Transition::ConnectionClosed, closes_connection),
    (Transition::AwaitingData, acknowledges_without_syn),
    (Transition::HandshakeAccepted, accepts_handshake),
];

fn failed_verification(verified: bool, _: &PacketMetadata) -> bool {
    !verified
}

fn carries_data(_: bool, packet: &PacketMetadata) -> bool {
    packet.has_payload()
}

fn closes_connection(_: bool, packet: &PacketMetadata) -> bool {
    packet.flags.rst || packet.flags.fin
}

fn acknowledges_without_syn(_: bool, packet: &PacketMetadata) -> bool {
    packet.flags.ack && !packet.flags.syn
}

fn accepts_handshake(_: bool, packet: &PacketMetadata) -> bool {
    packet.flags.syn && packet.flags.ack
}

/// First matching rule wins.
pub fn classify(verified: bool, packet: &PacketMetadata) -> Transition {
    RULES
        .iter()
        .find(|(_, applies)| applies(verified, packet))
        .map_or(Transition::Ignored, |(transition, _)| *transition)
}

#[derive(Debug)]
pub enum Action {
    /// Put the packet back on the timeout queue.
    Requeue(PacketMetadata),
    /// The connection is finished; report it, then optionally reset it.
    Complete {
        record: ScanRecord,
        reset: Option<Vec<u8>>,
    },
    /// The handshake was accepted; hand it to the prober, then requeue.
    Followup(PacketMetadata),
    Discard,
}

#[derive(Debug)]
pub struct Step {
    pub transition: Transition,
    pub action: Action,
}

pub struct Classifier {
    table: Arc<StateTable>,
    timeouts: TimeoutQueue,
    sink: CompletionSink,
    teardown: Arc<Teardown>,
    fingerprinter: Arc<dyn Fingerprinter>,
    followup: Option<mpsc::Sender<PacketMetadata>>,
}

impl Classifier {
    pub fn new(
        table: Arc<StateTable>,
        timeouts: TimeoutQueue,
        sink: CompletionSink,
        teardown: Arc<Teardown>,
        fingerprinter: Arc<dyn Fingerprinter>,
    ) -> Self {
        Self {
            table,
            timeouts,
            sink,
            teardown,
            fingerprinter,
            followup: None,
        }
    }

    pub fn with_followup(mut self, followup: mpsc::Sender<PacketMetadata>) -> Self {
        self.followup = Some(followup);
        self
    }

    pub fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    /// Classifies one inbound packet and performs everything it implies.
    pub async fn handle(&self, packet: PacketMetadata) -> anyhow::Result<Transition> {
        let step = self.apply(packet);
        if let Some(requeue) = self.perform(step.action).await? {
            self.timeouts.push(requeue).await?;
        }
        Ok(step.transition)
    }

    /// Verifies `packet` and applies its state-table mutation under one lock.
    pub fn apply(&self, mut packet: PacketMetadata) -> Step {
        let mut entry = self.table.lock(packet.identity());
        let verified = entry.verify(&packet);
        let transition = classify(verified, &packet);
        trace!("{} -> {transition:?}", packet.identity());

        match transition {
            Transition::VerificationFailed => {
                // Pin the stage the connection was in, so the retry goes
                // stale once the connection moves on.
                if let Some(handshake) = entry.get() {
                    packet.update_response(handshake.expected);
                }
                packet.increment_counter();
                packet.update_timestamp();
                packet.mark_validation_failed();
            }
            Transition::DataReceived | Transition::ConnectionClosed => {
                entry.remove();
            }
            Transition::AwaitingData => {
                packet.update_response(ExpectedResponse::Data);
                packet.update_timestamp();
                entry.update(&packet);
            }
            Transition::HandshakeAccepted => {
                packet.update_response(ExpectedResponse::Ack);
                packet.update_timestamp();
                entry.update(&packet);
            }
            Transition::Ignored => {}
        }
        drop(entry);

        let action = match transition {
            Transition::VerificationFailed | Transition::AwaitingData => Action::Requeue(packet),
            Transition::DataReceived => {
                let fingerprint = self.fingerprinter.fingerprint(&packet.payload);
                packet.fingerprint = Some(fingerprint.clone());
                let reset = self.teardown.construct(&packet);
                Action::Complete {
                    record: ScanRecord::new(packet, Outcome::Data { fingerprint }),
                    reset,
                }
            }
            Transition::ConnectionClosed => {
                let (reason, reset) = if packet.flags.rst {
                    (CloseReason::Rst, None)
                } else {
                    (CloseReason::Fin, self.teardown.construct(&packet))
                };
                Action::Complete {
                    record: ScanRecord::new(packet, Outcome::Closed(reason)),
                    reset,
                }
            }
            Transition::HandshakeAccepted => Action::Followup(packet),
            Transition::Ignored => Action::Discard,
        };

        Step { transition, action }
    }

    /// Re-checks a packet whose timeout has elapsed.
    ///
    /// Packets that failed verification go through [`Classifier::apply`] again.
    /// Verified ones only consume a retry, since their state is already recorded.
    pub fn recheck(&self, mut packet: PacketMetadata) -> Step {
        if packet.validation_failed {
            return self.apply(packet);
        }

        let retries = self.table.lock(packet.identity()).retry();
        match retries {
            Some(_) => {
                packet.increment_counter();
                packet.update_timestamp();
                Step {
                    transition: Transition::Ignored,
                    action: Action::Requeue(packet),
                }
            }
            None => Step {
                transition: Transition::Ignored,
                action: Action::Discard,
            },
        }
    }

    /// Performs an action's side effects. Returns the packet to requeue, if any.
    pub async fn perform(&self, action: Action) -> anyhow::Result<Option<PacketMetadata>> {
        match action {
            Action::Requeue(packet) => Ok(Some(packet)),
            Action::Complete { record, reset } => {
                self.sink.emit(record).await?;
                if let Some(frame) = reset {
                    self.teardown.transmit(&frame);
                }
                Ok(None)
            }
            Action::Followup(packet) => {
                if let Some(followup) = &self.followup {
                    if followup.send(packet.clone()).await.is_err() {
                        debug!("Follow-up channel closed, skipping {}", packet.identity());
                    }
                }
                Ok(Some(packet))
            }
            Action::Discard => Ok(None),
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
