//! The completion sink: the only place terminal [`ScanRecord`]s leave the engine.

use anyhow::Context;
use async_trait::async_trait;
use synack_common::record::ScanRecord;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone)]
pub struct CompletionSink {
    tx: mpsc::Sender<ScanRecord>,
}

impl CompletionSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ScanRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn emit(&self, record: ScanRecord) -> anyhow::Result<()> {
        debug!("Completed {}: {}", record.identity(), record.outcome);
        self.tx
            .send(record)
            .await
            .context("completion queue closed")
    }
}

#[async_trait]
pub trait ResultWriter: Send {
    async fn write(&mut self, record: &ScanRecord) -> anyhow::Result<()>;

    async fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Feeds every record into `writer` until all senders are gone.
pub async fn drain<W: ResultWriter + ?Sized>(
    mut rx: mpsc::Receiver<ScanRecord>,
    writer: &mut W,
) -> anyhow::Result<usize> {
    let mut written = 0;
    while let Some(record) = rx.recv().await {
        writer.write(&record).await?;
        written += 1;
    }
    writer.finish().await?;
    Ok(written)
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
