//! End-to-end checks of the response engine, driven with synthetic packets
//! and a recording packet writer. Nothing here needs raw-socket privileges.

pub mod util;

#[cfg(test)]
mod lifecycle;
#[cfg(test)]
mod scenarios;
