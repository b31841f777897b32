use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;
pub const DEFAULT_SHARDS: usize = 64;
pub const DEFAULT_SOURCE_PORT: u16 = 40_000;
/// Number of consecutive source ports handed out from `source_port` upwards.
pub const SOURCE_PORT_SPAN: u16 = 16_384;

/// What happens to handshakes still in flight when the engine stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Every remaining entry is reported as incomplete.
    #[default]
    Flush,
    /// Remaining entries are discarded; only their count is logged.
    Drop,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the blocklist. `None` disables target filtering.
    pub blocklist: Option<PathBuf>,
    /// Number of re-checks a target gets before it is reported as expired.
    pub max_retries: u32,
    /// Delay between a packet entering the timeout queue and its re-check.
    pub retry_interval: Duration,
    /// Capacity of each bounded queue (inbound, timeout, completion).
    pub queue_capacity: usize,
    /// Number of independently locked shards in the state table.
    pub shards: usize,
    pub shutdown_policy: ShutdownPolicy,
    /// Capture interface name. `None` picks the first usable one.
    pub interface: Option<String>,
    /// First source port used for probes.
    pub source_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocklist: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shards: DEFAULT_SHARDS,
            shutdown_policy: ShutdownPolicy::default(),
            interface: None,
            source_port: DEFAULT_SOURCE_PORT,
        }
    }
}

impl Config {
    /// The inclusive range of source ports probes are sent from.
    pub fn source_ports(&self) -> std::ops::RangeInclusive<u16> {
        let last = self.source_port.saturating_add(SOURCE_PORT_SPAN - 1);
        self.source_port..=last
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
