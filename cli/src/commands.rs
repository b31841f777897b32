pub mod check;
pub mod scan;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pnet::ipnetwork::IpNetwork;
use pnet::util::MacAddr;
use synack_common::config::{self, Config, ShutdownPolicy};
use synack_common::network::filter;

#[derive(Parser)]
#[command(name = "synack")]
#[command(about = "A stateless TCP scanner that waits for services to speak.")]
pub struct CommandLine {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe targets and report how each one answered
    #[command(alias = "s")]
    Scan(ScanArgs),
    /// Show which addresses a blocklist would exclude
    #[command(alias = "c")]
    Check {
        #[arg(short, long)]
        blocklist: PathBuf,
        #[arg(required = true, value_parser = parse_addr)]
        addrs: Vec<std::net::IpAddr>,
    },
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Addresses or CIDR blocks to probe
    #[arg(required = true, value_parser = parse_target)]
    pub targets: Vec<IpNetwork>,

    /// Destination ports, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "80")]
    pub ports: Vec<u16>,

    /// Capture interface (defaults to the first usable one)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// MAC address of the next hop every frame is sent to
    #[arg(long, value_parser = parse_mac)]
    pub gateway_mac: MacAddr,

    /// File of addresses and CIDR blocks that must never be probed
    #[arg(short, long)]
    pub blocklist: Option<PathBuf>,

    #[arg(long, default_value_t = config::DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 1_000)]
    pub retry_interval_ms: u64,

    /// Send an HTTP request after the handshake instead of waiting for a banner
    #[arg(long)]
    pub http: bool,

    /// Discard unfinished handshakes at exit instead of reporting them
    #[arg(long)]
    pub drop_incomplete: bool,

    /// First source port used for probes
    #[arg(long, default_value_t = config::DEFAULT_SOURCE_PORT)]
    pub source_port: u16,
}

impl ScanArgs {
    pub fn to_config(&self) -> Config {
        Config {
            blocklist: self.blocklist.clone(),
            max_retries: self.max_retries,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            shutdown_policy: match self.drop_incomplete {
                true => ShutdownPolicy::Drop,
                false => ShutdownPolicy::Flush,
            },
            interface: self.interface.clone(),
            source_port: self.source_port,
            ..Config::default()
        }
    }
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

fn parse_target(text: &str) -> Result<IpNetwork, String> {
    filter::parse_network(text).ok_or_else(|| format!("'{text}' is not an address or CIDR block"))
}

fn parse_addr(text: &str) -> Result<std::net::IpAddr, String> {
    text.parse().map_err(|_| format!("'{text}' is not an IP address"))
}

fn parse_mac(text: &str) -> Result<MacAddr, String> {
    text.parse().map_err(|_| format!("'{text}' is not a MAC address"))
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
