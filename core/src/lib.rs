//! # Synack Core
//!
//! The response-processing engine of the scanner. Inbound TCP segments are
//! verified against the [`state`] table, run through the [`classifier`], and
//! either re-checked later by the [`timeout`] worker or finalized through the
//! [`completion`] sink, with [`teardown`] closing the remote side.
//!
//! The [`engine`] module wires those pieces into running tasks; [`network`]
//! and [`prober`] provide the raw-socket collaborators around them.

pub mod classifier;
pub mod completion;
pub mod engine;
pub mod fingerprint;
pub mod network;
pub mod prober;
pub mod state;
pub mod teardown;
pub mod timeout;
