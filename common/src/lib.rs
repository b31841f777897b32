//! # Synack Common
//!
//! Types shared between the engine and its front-ends: the runtime [`config`],
//! the packet model and target filter in [`network`], and the terminal
//! [`record`]s handed to output writers.

pub mod config;
pub mod network;
pub mod record;
