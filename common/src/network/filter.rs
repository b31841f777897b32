//! # Target Filter
//!
//! Longest-prefix-match structure over the networks a scan must never touch.
//!
//! The blocklist is a newline-delimited file of bare addresses or CIDR blocks.
//! Anything after `#` is a comment, surrounding whitespace is ignored, and
//! lines that parse as neither form are skipped with a warning rather than
//! aborting the scan. Only failing to open or read the file is fatal.
//!
//! Each address family is stored in its own binary trie. A prefix that is
//! already covered by a stored prefix is never inserted, and inserting a
//! broader prefix prunes the narrower ones beneath it, so stored entries never
//! nest.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use pnet::ipnetwork::IpNetwork;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

const V4_WIDTH: u8 = 32;
const V6_WIDTH: u8 = 128;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to open blocklist {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read blocklist: {0}")]
    Read(#[from] io::Error),
}

/// Counters collected while building a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub inserted: usize,
    /// Prefixes skipped because a stored prefix already covered them.
    pub covered: usize,
    pub malformed: usize,
    pub blank: usize,
}

#[derive(Debug, Clone, Default)]
struct Node {
    children: [Option<u32>; 2],
    terminal: bool,
}

#[derive(Debug, Clone)]
struct PrefixTrie {
    nodes: Vec<Node>,
    width: u8,
    entries: usize,
}

impl PrefixTrie {
    fn new(width: u8) -> Self {
        Self {
            nodes: vec![Node::default()],
            width,
            entries: 0,
        }
    }

    fn bit(&self, key: u128, depth: u8) -> usize {
        ((key >> (self.width - 1 - depth)) & 1) as usize
    }

    /// Returns `false` if a stored prefix already covers `key/len`.
    fn insert(&mut self, key: u128, len: u8) -> bool {
        let mut index: usize = 0;
        for depth in 0..len {
            if self.nodes[index].terminal {
                return false;
            }
            let bit = self.bit(key, depth);
            index = match self.nodes[index].children[bit] {
                Some(child) => child as usize,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[index].children[bit] = Some(child as u32);
                    child
                }
            };
        }

        if self.nodes[index].terminal {
            return false;
        }

        let pruned = self.terminals_below(index);
        self.nodes[index] = Node {
            children: [None, None],
            terminal: true,
        };
        self.entries = self.entries + 1 - pruned;
        true
    }

    fn terminals_below(&self, index: usize) -> usize {
        let mut stack: Vec<u32> = self.nodes[index].children.iter().flatten().copied().collect();
        let mut count: usize = 0;
        while let Some(child) = stack.pop() {
            let node = &self.nodes[child as usize];
            if node.terminal {
                count += 1;
            } else {
                stack.extend(node.children.iter().flatten().copied());
            }
        }
        count
    }

    /// Prefix length of the stored entry containing `key`.
    ///
    /// Entries never nest, so the first terminal on the path is the longest match.
    fn longest_match(&self, key: u128) -> Option<u8> {
        let mut index: usize = 0;
        let mut depth: u8 = 0;
        loop {
            let node = &self.nodes[index];
            if node.terminal {
                return Some(depth);
            }
            if depth == self.width {
                return None;
            }
            index = node.children[self.bit(key, depth)]? as usize;
            depth += 1;
        }
    }
}

enum Line {
    Blank,
    Network(IpNetwork),
    Malformed(String),
}

fn parse_line(raw: &str) -> Line {
    let content: &str = raw.split_once('#').map_or(raw, |(before, _)| before).trim();

    if content.is_empty() {
        return Line::Blank;
    }

    if content.contains('/') {
        return match content.parse::<IpNetwork>() {
            Ok(network) => Line::Network(network),
            Err(_) => Line::Malformed(content.to_string()),
        };
    }

    match content.parse::<IpAddr>() {
        Ok(addr) => Line::Network(IpNetwork::from(addr)),
        Err(_) => Line::Malformed(content.to_string()),
    }
}

/// Parses a bare address or CIDR block, with the same rules as a blocklist line.
pub fn parse_network(text: &str) -> Option<IpNetwork> {
    match parse_line(text) {
        Line::Network(network) => Some(network),
        Line::Blank | Line::Malformed(_) => None,
    }
}

/// The scan-time gate deciding whether an address may be probed.
///
/// An empty filter is the permissive state used when no blocklist is
/// configured: it reports every address as allowed.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    v4: PrefixTrie,
    v6: PrefixTrie,
    stats: FilterStats,
}

impl Default for TargetFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl TargetFilter {
    pub fn empty() -> Self {
        Self {
            v4: PrefixTrie::new(V4_WIDTH),
            v6: PrefixTrie::new(V6_WIDTH),
            stats: FilterStats::default(),
        }
    }

    /// Builds the filter from the blocklist at `path`, or an empty filter if
    /// no path is configured.
    pub fn build(path: Option<&Path>) -> Result<Self, FilterError> {
        let Some(path) = path else {
            debug!("No blocklist configured, target filtering disabled");
            return Ok(Self::empty());
        };

        let file: File = File::open(path).map_err(|source| FilterError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let filter: TargetFilter = Self::from_reader(BufReader::new(file))?;

        let stats: FilterStats = filter.stats();
        info!(
            "Loaded {} blocklist entries from {} ({} covered, {} invalid)",
            filter.len(),
            path.display(),
            stats.covered,
            stats.malformed
        );
        Ok(filter)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, FilterError> {
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let parsed: Vec<Line> = lines.par_iter().map(|line| parse_line(line)).collect();

        let mut filter = Self::empty();
        for (idx, line) in parsed.into_iter().enumerate() {
            match line {
                Line::Blank => {
                    filter.stats.blank += 1;
                    debug!("Blocklist line {} is empty, skipping", idx + 1);
                }
                Line::Malformed(entry) => {
                    filter.stats.malformed += 1;
                    warn!("Skipping invalid blocklist entry '{entry}' on line {}", idx + 1);
                }
                Line::Network(network) => {
                    filter.insert(network);
                }
            }
        }
        Ok(filter)
    }

    /// Adds a network unless an existing entry already covers it.
    pub fn insert(&mut self, network: IpNetwork) -> bool {
        let inserted = match network {
            IpNetwork::V4(net) => self.v4.insert(u32::from(net.network()) as u128, net.prefix()),
            IpNetwork::V6(net) => self.v6.insert(u128::from(net.network()), net.prefix()),
        };

        if inserted {
            self.stats.inserted += 1;
        } else {
            self.stats.covered += 1;
        }
        inserted
    }

    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        self.matching_prefix(addr).is_some()
    }

    /// The stored network that contains `addr`, if any.
    pub fn matching_prefix(&self, addr: IpAddr) -> Option<IpNetwork> {
        match addr {
            IpAddr::V4(v4) => {
                let len = self.v4.longest_match(u32::from(v4) as u128)?;
                let mask: u32 = u32::MAX.checked_shl(u32::from(V4_WIDTH - len)).unwrap_or(0);
                IpNetwork::new(IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask)), len).ok()
            }
            IpAddr::V6(v6) => {
                let len = self.v6.longest_match(u128::from(v6))?;
                let mask: u128 = u128::MAX.checked_shl(u32::from(V6_WIDTH - len)).unwrap_or(0);
                IpNetwork::new(IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask)), len).ok()
            }
        }
    }

    /// Number of stored entries across both families.
    pub fn len(&self) -> usize {
        self.v4.entries + self.v6.entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
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
