// ============================================================================
// Feed Worker Pool
// ============================================================================
//
// One tokio task per shard drives the reconciliation processor:
//
//   loop:
//     fetch batch from checkpoint ──> process each record in order
//       Ok         ──> acknowledge (checkpoint + 1)
//       Retryable  ──> back off, refetch from the same checkpoint
//       Permanent  ──> dead-letter, then acknowledge
//     empty batch ──> wait for appends or stop
//
// A retryable failure blocks only its own shard. Redelivery is unbounded; the
// backoff is capped by `FeedConfig::retry_max_backoff_ms`.
// ============================================================================

use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::stream::{ChangeFeed, Delivery};
use crate::config::FeedConfig;
use crate::core::{ProcessError, QuotaError, Result};
use crate::reconcile::{ReconciliationProcessor, RecordOutcome};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

/// Counters across all shard workers of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedWorkerStats {
    pub processed: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub retries: u64,
    pub dead_lettered: u64,
}

#[derive(Default)]
struct WorkerCounters {
    processed: AtomicU64,
    applied: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    ignored: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
}

impl WorkerCounters {
    fn record(&self, outcome: RecordOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            RecordOutcome::Applied(_) => &self.applied,
            RecordOutcome::Duplicate(_) => &self.duplicates,
            RecordOutcome::Skipped => &self.skipped,
            RecordOutcome::Ignored => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> FeedWorkerStats {
        FeedWorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Why a shard loop stopped working through its batch.
enum Interrupt {
    /// Back off, then refetch from the checkpoint.
    Redeliver,
    Stop,
}

struct ShardWorker {
    shard: u32,
    feed: Arc<ChangeFeed>,
    processor: Arc<ReconciliationProcessor>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: FeedConfig,
    counters: Arc<WorkerCounters>,
}

impl ShardWorker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let span = info_span!("feed.worker", shard = self.shard);
        async move {
            event!(Level::DEBUG, "shard worker started");
            let mut consecutive_failures: u32 = 0;

            loop {
                let stopping = *stop_rx.borrow();
                if stopping {
                    break;
                }

                let batch = match self.feed.fetch(self.shard, self.config.batch_size) {
                    Ok(batch) => batch,
                    Err(err) => {
                        event!(Level::ERROR, error = %err, "shard fetch failed, worker exiting");
                        break;
                    }
                };

                if batch.is_empty() {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        waited = self.feed.wait_for_records(self.shard) => {
                            if let Err(err) = waited {
                                event!(Level::ERROR, error = %err, "shard wait failed, worker exiting");
                                break;
                            }
                        }
                    }
                    continue;
                }

                match self.process_batch(batch).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        if !self.config.retain_acknowledged {
                            self.compact();
                        }
                    }
                    Err(Interrupt::Redeliver) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        let backoff = self.config.redelivery_backoff(consecutive_failures);
                        event!(
                            Level::DEBUG,
                            attempt = consecutive_failures,
                            backoff_ms = backoff.as_millis() as u64,
                            "backing off before redelivery"
                        );
                        tokio::select! {
                            _ = stop_rx.changed() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    Err(Interrupt::Stop) => break,
                }
            }

            event!(Level::DEBUG, "shard worker stopped");
        }
        .instrument(span)
        .await
    }

    fn compact(&self) {
        match self.feed.compact(self.shard) {
            Ok(dropped) => event!(Level::TRACE, dropped, "shard compacted"),
            Err(err) => event!(Level::WARN, error = %err, "shard compaction failed"),
        }
    }

    async fn process_batch(&self, batch: Vec<Delivery>) -> std::result::Result<(), Interrupt> {
        for delivery in batch {
            match self.processor.process_record(&delivery.record).await {
                Ok(outcome) => self.counters.record(outcome),
                Err(ProcessError::Retryable(err)) => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    event!(
                        Level::WARN,
                        offset = delivery.offset,
                        error = %err,
                        "record will be redelivered"
                    );
                    return Err(Interrupt::Redeliver);
                }
                Err(ProcessError::Permanent(err)) => {
                    if let Err(sink_err) = self.dead_letter(&delivery, &err).await {
                        event!(
                            Level::WARN,
                            offset = delivery.offset,
                            error = %sink_err,
                            "dead-letter sink rejected record, will retry"
                        );
                        return Err(Interrupt::Redeliver);
                    }
                }
            }

            if let Err(err) = self.feed.acknowledge(self.shard, delivery.offset) {
                event!(Level::ERROR, offset = delivery.offset, error = %err, "acknowledge failed");
                return Err(Interrupt::Stop);
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, err: &QuotaError) -> Result<()> {
        let letter = DeadLetter {
            shard: delivery.shard,
            offset: delivery.offset,
            record: delivery.record.clone(),
            error: err.to_string(),
            failed_at: Utc::now(),
        };
        self.dead_letters.send(letter).await?;
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        event!(
            Level::ERROR,
            offset = delivery.offset,
            key = %delivery.record.key,
            error = %err,
            "record dead-lettered"
        );
        Ok(())
    }
}

/// Background consumers, one per shard of the feed.
pub struct FeedWorkerPool {
    feed: Arc<ChangeFeed>,
    counters: Arc<WorkerCounters>,
    stop_tx: Option<watch::Sender<bool>>,
    join_handles: Vec<JoinHandle<()>>,
}

impl FeedWorkerPool {
    /// Starts one worker per shard. Must be called inside a tokio runtime.
    pub fn spawn(
        feed: Arc<ChangeFeed>,
        processor: Arc<ReconciliationProcessor>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: FeedConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = Arc::new(WorkerCounters::default());

        let join_handles = (0..feed.shard_count())
            .map(|shard| {
                let worker = ShardWorker {
                    shard,
                    feed: feed.clone(),
                    processor: processor.clone(),
                    dead_letters: dead_letters.clone(),
                    config: config.clone(),
                    counters: counters.clone(),
                };
                tokio::spawn(worker.run(stop_rx.clone()))
            })
            .collect();

        Self {
            feed,
            counters,
            stop_tx: Some(stop_tx),
            join_handles,
        }
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    pub fn worker_count(&self) -> usize {
        self.join_handles.len()
    }

    pub fn stats(&self) -> FeedWorkerStats {
        self.counters.snapshot()
    }

    /// Signals every worker to stop and waits for them to finish.
    ///
    /// A worker stops between records; unacknowledged records stay on the feed.
    pub async fn stop(mut self) -> Result<FeedWorkerStats> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }

        let handles = std::mem::take(&mut self.join_handles);
        for joined in futures::future::join_all(handles).await {
            joined.map_err(|err| QuotaError::ExecutionError(format!("feed worker join: {}", err)))?;
        }
        Ok(self.counters.snapshot())
    }
}

impl Drop for FeedWorkerPool {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for handle in self.join_handles.drain(..) {
            handle.abort();
        }
    }
}
