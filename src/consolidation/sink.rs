use std::future::Future;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::{models::ResolvedInterval, Database};

const ENABLE_LOGS: bool = true;

/// Destination of resolved interval batches.
pub trait IntervalWriter: Send + Sync + 'static {
    fn write_batch(
        &self,
        batch: Vec<ResolvedInterval>,
    ) -> impl Future<Output = Result<usize>> + Send;
}

impl IntervalWriter for Database {
    fn write_batch(
        &self,
        batch: Vec<ResolvedInterval>,
    ) -> impl Future<Output = Result<usize>> + Send {
        self.insert_resolved_batch(batch)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub written: usize,
    pub batches: usize,
}

/// Producer side of a [`BatchedSink`]. Cloned into every entity task.
#[derive(Clone)]
pub struct SinkHandle {
    sender: mpsc::Sender<ResolvedInterval>,
}

impl SinkHandle {
    /// Waits while the channel is full.
    pub async fn enqueue(&self, interval: ResolvedInterval) -> Result<()> {
        self.sender
            .send(interval)
            .await
            .map_err(|_| anyhow!("resolved interval sink is closed"))
    }
}

/// Bounded queue drained by one writer task in batches of at most
/// `batch_size` intervals.
pub struct BatchedSink {
    sender: mpsc::Sender<ResolvedInterval>,
    writer: JoinHandle<Result<SinkStats>>,
}

impl BatchedSink {
    pub fn spawn<W: IntervalWriter>(writer: W, batch_size: usize, capacity: usize) -> Self {
        let batch_size = batch_size.max(1);
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(drain(writer, receiver, batch_size));
        Self { sender, writer }
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            sender: self.sender.clone(),
        }
    }

    /// Close the queue and wait until everything enqueued has been written.
    ///
    /// Handles still held by producers keep the writer alive, so drop them
    /// first.
    pub async fn close(self) -> Result<SinkStats> {
        drop(self.sender);
        self.writer
            .await
            .context("resolved interval writer panicked")?
    }
}

async fn drain<W: IntervalWriter>(
    writer: W,
    mut receiver: mpsc::Receiver<ResolvedInterval>,
    batch_size: usize,
) -> Result<SinkStats> {
    let mut stats = SinkStats::default();
    let mut buffer = Vec::with_capacity(batch_size);

    while receiver.recv_many(&mut buffer, batch_size).await > 0 {
        let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
        let size = batch.len();
        let started = Instant::now();
        let written = match writer.write_batch(batch).await {
            Ok(written) => written,
            Err(err) => {
                // Stop accepting so producers fail fast instead of blocking.
                receiver.close();
                return Err(err.context(format!(
                    "failed to write batch of {size} resolved intervals"
                )));
            }
        };
        stats.written += written;
        stats.batches += 1;
        crate::log_elapsed!(started, "[Sink] wrote batch of {} intervals", written);
    }

    crate::log_info!(
        "[Sink] drained: {} intervals in {} batches",
        stats.written,
        stats.batches
    );
    Ok(stats)
}
