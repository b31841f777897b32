use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use synack_common::network::filter::TargetFilter;
use tracing::info;

pub fn check(blocklist: &Path, addrs: &[IpAddr]) -> anyhow::Result<()> {
    let filter = TargetFilter::build(Some(blocklist)).context("loading blocklist")?;

    for addr in addrs {
        match filter.matching_prefix(*addr) {
            Some(prefix) => info!("{addr} is blocked by {prefix}"),
            None => info!("{addr} is allowed"),
        }
    }
    Ok(())
}
