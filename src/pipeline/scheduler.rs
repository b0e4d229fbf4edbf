//! Concurrency scheduler
//!
//! A fixed pool of `concurrency` workers pulls keys from one shared queue and
//! pushes each result into a channel. A single consumer groups results into
//! `batch_size` transform batches, accumulates rows and hands them to the
//! saver once the tally reaches `save_interval`. A final save always runs
//! after the last batch.
//!
//! A rate limit from any worker raises the abort flag: no worker pulls another
//! key, in-flight workers are cancelled and the accumulated rows are dropped
//! without being saved.

use super::paginator::{KeyFetcher, KeyOutcome};
use super::query::QueryKey;
use super::save::Saver;
use super::transform::{TableBatch, Transform};
use crate::error::{HarvestError, HarvestResult};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub save_interval: usize,
}

impl SchedulerConfig {
    pub fn new(concurrency: usize, batch_size: usize, save_interval: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
            save_interval: save_interval.max(1),
        }
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub keys: usize,
    pub completed: usize,
    pub failed: usize,
    pub overflowed: usize,
    pub rows: usize,
    pub checkpoints: usize,
}

enum WorkerMessage {
    Done(QueryKey, KeyOutcome),
    Dropped(QueryKey),
    Aborted(HarvestError),
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<VecDeque<QueryKey>>>,
    fetcher: Arc<dyn KeyFetcher>,
    abort: Arc<AtomicBool>,
    tx: mpsc::Sender<WorkerMessage>,
) {
    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let key = match queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
            Some(key) => key,
            None => break,
        };

        let message = match AssertUnwindSafe(fetcher.fetch_key(&key)).catch_unwind().await {
            Ok(Ok(outcome)) => WorkerMessage::Done(key, outcome),
            Ok(Err(e)) if e.is_rate_limit() => {
                abort.store(true, Ordering::SeqCst);
                let _ = tx.send(WorkerMessage::Aborted(e)).await;
                break;
            }
            Ok(Err(e)) => {
                log::error!("❌ Worker {} dropped {}: {}", id, key, e);
                WorkerMessage::Dropped(key)
            }
            Err(_) => {
                log::error!("❌ Worker {} panicked on {}, key dropped", id, key);
                WorkerMessage::Dropped(key)
            }
        };

        if tx.send(message).await.is_err() {
            break;
        }
    }
    log::debug!("Worker {} finished", id);
}

/// Accumulates transformed rows between checkpoints
struct Accumulator<'a> {
    transform: &'a dyn Transform,
    saver: &'a dyn Saver,
    save_interval: usize,
    pending: Vec<(QueryKey, KeyOutcome)>,
    rows: TableBatch,
    tally: usize,
    started: Instant,
}

impl<'a> Accumulator<'a> {
    fn flush_pending(&mut self, summary: &mut RunSummary) -> HarvestResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = self.transform.transform(std::mem::take(&mut self.pending))?;
        let count = batch.row_count();
        self.rows.extend(batch);
        self.tally += count;
        summary.rows += count;
        Ok(())
    }

    async fn checkpoint(&mut self, summary: &mut RunSummary) -> HarvestResult<()> {
        let rows = std::mem::take(&mut self.rows);
        let count = rows.row_count();
        self.saver.save(rows).await?;
        self.tally = 0;
        summary.checkpoints += 1;
        log::info!(
            "💾 Checkpoint {}: {} rows saved ({} total, {:.1}s elapsed)",
            summary.checkpoints,
            count,
            summary.rows,
            self.started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    async fn on_batch(&mut self, summary: &mut RunSummary) -> HarvestResult<()> {
        self.flush_pending(summary)?;
        if self.tally >= self.save_interval {
            self.checkpoint(summary).await?;
        }
        Ok(())
    }
}

async fn consume(
    rx: &mut mpsc::Receiver<WorkerMessage>,
    acc: &mut Accumulator<'_>,
    batch_size: usize,
    summary: &mut RunSummary,
) -> HarvestResult<()> {
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Done(key, outcome) => {
                match &outcome {
                    KeyOutcome::Overflow(_) => summary.overflowed += 1,
                    KeyOutcome::Failed(_) => summary.failed += 1,
                    _ => summary.completed += 1,
                }
                acc.pending.push((key, outcome));
                if acc.pending.len() >= batch_size {
                    acc.on_batch(summary).await?;
                }
            }
            WorkerMessage::Dropped(_) => summary.failed += 1,
            WorkerMessage::Aborted(e) => return Err(e),
        }
    }

    acc.on_batch(summary).await?;
    // final flush of the remainder, even when nothing accumulated
    acc.checkpoint(summary).await
}

/// Run every key through `fetcher`, transforming and saving as results arrive
pub async fn run_all(
    keys: Vec<QueryKey>,
    fetcher: Arc<dyn KeyFetcher>,
    transform: &dyn Transform,
    saver: &dyn Saver,
    config: SchedulerConfig,
) -> HarvestResult<RunSummary> {
    let config = SchedulerConfig::new(config.concurrency, config.batch_size, config.save_interval);
    let mut summary = RunSummary {
        keys: keys.len(),
        ..RunSummary::default()
    };
    log::info!(
        "🚀 Starting run: {} keys, concurrency {}, batch size {}, save interval {}",
        keys.len(),
        config.concurrency,
        config.batch_size,
        config.save_interval
    );

    let queue = Arc::new(Mutex::new(keys.into_iter().collect::<VecDeque<_>>()));
    let abort = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel(config.concurrency * 2);

    let mut workers = JoinSet::new();
    for id in 0..config.concurrency {
        workers.spawn(worker(
            id,
            Arc::clone(&queue),
            Arc::clone(&fetcher),
            Arc::clone(&abort),
            tx.clone(),
        ));
    }
    drop(tx);

    let mut acc = Accumulator {
        transform,
        saver,
        save_interval: config.save_interval,
        pending: Vec::new(),
        rows: TableBatch::new(),
        tally: 0,
        started: Instant::now(),
    };

    let result = consume(&mut rx, &mut acc, config.batch_size, &mut summary).await;
    if let Err(e) = result {
        abort.store(true, Ordering::SeqCst);
        rx.close();
        workers.shutdown().await;
        if e.is_rate_limit() {
            log::error!(
                "🛑 Rate limited, run aborted with {} unsaved rows: {}",
                acc.rows.row_count(),
                e
            );
        }
        return Err(e);
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            log::error!("❌ Worker task failed: {}", e);
        }
    }

    log::info!(
        "✅ Run finished: {} completed, {} failed, {} overflowed, {} rows in {} checkpoints",
        summary.completed,
        summary.failed,
        summary.overflowed,
        summary.rows,
        summary.checkpoints
    );
    Ok(summary)
}
