use std::collections::BTreeMap;
use std::io::Write;

use async_trait::async_trait;
use colored::*;
use synack_common::record::{Outcome, ScanRecord};
use synack_core::completion::ResultWriter;

/// Prints one line per finished target, then a count per outcome.
pub struct TerminalWriter<W: Write + Send> {
    out: W,
    counts: BTreeMap<&'static str, usize>,
}

impl TerminalWriter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> TerminalWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            counts: BTreeMap::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn colorize(outcome: &Outcome) -> ColoredString {
    let text = outcome.to_string();
    match outcome {
        Outcome::Data { .. } => text.green().bold(),
        Outcome::Closed(_) => text.yellow(),
        Outcome::Expired => text.bright_black(),
        Outcome::Incomplete => text.red(),
    }
}

#[async_trait]
impl<W: Write + Send> ResultWriter for TerminalWriter<W> {
    async fn write(&mut self, record: &ScanRecord) -> anyhow::Result<()> {
        *self.counts.entry(record.outcome.label()).or_default() += 1;
        writeln!(
            self.out,
            "{:<46} {:<18} ttl={} win={}",
            record.identity().to_string(),
            colorize(&record.outcome),
            record.packet.ttl,
            record.packet.window
        )?;
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        let total: usize = self.counts.values().sum();
        let breakdown: Vec<String> = self
            .counts
            .iter()
            .map(|(label, count)| format!("{label}={count}"))
            .collect();
        writeln!(self.out, "{} targets finished: {}", total, breakdown.join(" "))?;
        self.out.flush()?;
        Ok(())
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
