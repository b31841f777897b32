use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{Context, bail};
use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
use pnet::util::MacAddr;
use synack_core::prober::LinkConfig;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ViabilityError {
    IsDown,
    IsLoopback,
    NoMacAddress,
    NoAddress,
}

/// Picks the named interface, or the first one able to send raw frames.
pub fn select(name: Option<&str>) -> anyhow::Result<NetworkInterface> {
    select_from(datalink::interfaces(), name)
}

fn select_from(interfaces: Vec<NetworkInterface>, name: Option<&str>) -> anyhow::Result<NetworkInterface> {
    if let Some(name) = name {
        let intf = interfaces
            .into_iter()
            .find(|intf| intf.name == name)
            .with_context(|| format!("no interface named {name}"))?;
        if let Err(e) = is_viable(&intf) {
            bail!("interface {name} cannot be used: {e:?}");
        }
        return Ok(intf);
    }

    match interfaces.into_iter().find(|intf| is_viable(intf).is_ok()) {
        Some(intf) => Ok(intf),
        None => bail!("no interface available for scanning"),
    }
}

fn is_viable(intf: &NetworkInterface) -> Result<(), ViabilityError> {
    if !intf.is_up() {
        return Err(ViabilityError::IsDown);
    }
    if intf.is_loopback() {
        return Err(ViabilityError::IsLoopback);
    }
    if intf.mac.is_none_or(|mac| mac == MacAddr::zero()) {
        return Err(ViabilityError::NoMacAddress);
    }
    if local_v4(intf).is_none() && local_v6(intf).is_none() {
        return Err(ViabilityError::NoAddress);
    }
    Ok(())
}

fn local_v4(intf: &NetworkInterface) -> Option<Ipv4Addr> {
    intf.ips.iter().find_map(|net| match net {
        IpNetwork::V4(v4) if !v4.ip().is_loopback() => Some(v4.ip()),
        _ => None,
    })
}

fn local_v6(intf: &NetworkInterface) -> Option<Ipv6Addr> {
    intf.ips.iter().find_map(|net| match net {
        IpNetwork::V6(v6) if !v6.ip().is_loopback() && !v6.ip().is_unicast_link_local() => Some(v6.ip()),
        _ => None,
    })
}

pub fn link_config(intf: &NetworkInterface, gateway_mac: MacAddr) -> anyhow::Result<LinkConfig> {
    let src_mac = intf.mac.with_context(|| format!("{} has no MAC address", intf.name))?;
    Ok(LinkConfig {
        src_mac,
        gateway_mac,
        local_v4: local_v4(intf),
        local_v6: local_v6(intf),
    })
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
