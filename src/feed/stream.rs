// ============================================================================
// Change Feed
// ============================================================================
//
// Per-shard ordered logs of committed mutations with a checkpoint per shard.
//
//   publish ──> shard log [base .. checkpoint .. end]
//                              │
//               fetch(shard) ──┘  returns records from the checkpoint on
//               acknowledge      advances the checkpoint by one, in order
//               rewind           moves the checkpoint back (redelivery)
//
// Delivery is at-least-once: nothing past the checkpoint is ever considered
// consumed, so a consumer that fails or crashes sees the same records again.
// Records of one key always land on the same shard, in commit order.
// ============================================================================

use super::record::ChangeRecord;
use super::shard::stable_shard_for;
use crate::core::{QuotaError, Result};
use crate::storage::ItemKey;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A record handed to a consumer together with its shard offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub shard: u32,
    pub offset: u64,
    pub record: ChangeRecord,
}

#[derive(Debug, Default)]
struct ShardState {
    /// Retained records; `records[0]` sits at offset `base_offset`.
    records: VecDeque<ChangeRecord>,
    base_offset: u64,
    /// Offset of the next record to deliver.
    checkpoint: u64,
}

impl ShardState {
    fn end_offset(&self) -> u64 {
        self.base_offset + self.records.len() as u64
    }

    fn pending(&self) -> u64 {
        self.end_offset() - self.checkpoint
    }
}

struct ShardLog {
    state: Mutex<ShardState>,
    appended: Notify,
    acknowledged: Notify,
}

impl ShardLog {
    fn new() -> Self {
        Self {
            state: Mutex::new(ShardState::default()),
            appended: Notify::new(),
            acknowledged: Notify::new(),
        }
    }
}

/// Snapshot of one shard's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPosition {
    pub shard: u32,
    pub checkpoint: u64,
    pub end_offset: u64,
    pub retained: usize,
}

pub struct ChangeFeed {
    shards: Vec<ShardLog>,
}

impl ChangeFeed {
    pub fn new(shard_count: u32) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| ShardLog::new()).collect(),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard_for(&self, key: &ItemKey) -> u32 {
        stable_shard_for(key, self.shard_count())
    }

    fn shard(&self, shard: u32) -> Result<&ShardLog> {
        self.shards.get(shard as usize).ok_or_else(|| {
            QuotaError::ExecutionError(format!(
                "shard {} out of range (shard_count={})",
                shard,
                self.shards.len()
            ))
        })
    }

    /// Appends a committed mutation to the shard owning its key.
    pub fn publish(&self, record: ChangeRecord) -> Result<u32> {
        let shard_id = self.shard_for(&record.key);
        let shard = self.shard(shard_id)?;
        {
            let mut state = shard.state.lock()?;
            state.records.push_back(record);
        }
        shard.appended.notify_waiters();
        Ok(shard_id)
    }

    /// Returns up to `max` records starting at the shard checkpoint.
    ///
    /// Does not advance the checkpoint; repeated calls return the same records
    /// until they are acknowledged.
    pub fn fetch(&self, shard_id: u32, max: usize) -> Result<Vec<Delivery>> {
        let shard = self.shard(shard_id)?;
        let state = shard.state.lock()?;
        let skip = (state.checkpoint - state.base_offset) as usize;
        Ok(state
            .records
            .iter()
            .skip(skip)
            .take(max.max(1))
            .enumerate()
            .map(|(i, record)| Delivery {
                shard: shard_id,
                offset: state.checkpoint + i as u64,
                record: record.clone(),
            })
            .collect())
    }

    /// Marks the record at `offset` as processed and advances the checkpoint.
    ///
    /// Acknowledging an offset below the checkpoint is a no-op (duplicate ack).
    /// Acknowledgements must otherwise arrive in order.
    pub fn acknowledge(&self, shard_id: u32, offset: u64) -> Result<()> {
        let shard = self.shard(shard_id)?;
        {
            let mut state = shard.state.lock()?;
            if offset < state.checkpoint {
                return Ok(());
            }
            if offset != state.checkpoint || offset >= state.end_offset() {
                return Err(QuotaError::ExecutionError(format!(
                    "out-of-order acknowledgement on shard {}: offset {} (checkpoint {}, end {})",
                    shard_id,
                    offset,
                    state.checkpoint,
                    state.end_offset()
                )));
            }
            state.checkpoint += 1;
        }
        shard.acknowledged.notify_waiters();
        Ok(())
    }

    /// Moves the checkpoint back so retained records are delivered again.
    pub fn rewind(&self, shard_id: u32, offset: u64) -> Result<()> {
        let shard = self.shard(shard_id)?;
        {
            let mut state = shard.state.lock()?;
            if offset < state.base_offset || offset > state.checkpoint {
                return Err(QuotaError::ExecutionError(format!(
                    "cannot rewind shard {} to {} (retained from {}, checkpoint {})",
                    shard_id, offset, state.base_offset, state.checkpoint
                )));
            }
            state.checkpoint = offset;
        }
        shard.appended.notify_waiters();
        Ok(())
    }

    /// Rewinds every shard to its oldest retained record.
    pub fn replay_all(&self) -> Result<()> {
        for shard_id in 0..self.shard_count() {
            let base = self.shard(shard_id)?.state.lock()?.base_offset;
            self.rewind(shard_id, base)?;
        }
        Ok(())
    }

    /// Drops acknowledged records; they can no longer be rewound to.
    pub fn compact(&self, shard_id: u32) -> Result<usize> {
        let shard = self.shard(shard_id)?;
        let mut state = shard.state.lock()?;
        let drop_count = (state.checkpoint - state.base_offset) as usize;
        state.records.drain(..drop_count);
        state.base_offset = state.checkpoint;
        Ok(drop_count)
    }

    pub fn pending(&self, shard_id: u32) -> Result<u64> {
        Ok(self.shard(shard_id)?.state.lock()?.pending())
    }

    pub fn total_pending(&self) -> Result<u64> {
        let mut total = 0;
        for shard_id in 0..self.shard_count() {
            total += self.pending(shard_id)?;
        }
        Ok(total)
    }

    pub fn position(&self, shard_id: u32) -> Result<ShardPosition> {
        let state = self.shard(shard_id)?.state.lock()?;
        Ok(ShardPosition {
            shard: shard_id,
            checkpoint: state.checkpoint,
            end_offset: state.end_offset(),
            retained: state.records.len(),
        })
    }

    /// Every retained delivery for `key`, in commit order.
    pub fn deliveries_for_key(&self, key: &ItemKey) -> Result<Vec<Delivery>> {
        let shard_id = self.shard_for(key);
        let state = self.shard(shard_id)?.state.lock()?;
        Ok(state
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| &record.key == key)
            .map(|(i, record)| Delivery {
                shard: shard_id,
                offset: state.base_offset + i as u64,
                record: record.clone(),
            })
            .collect())
    }

    /// Waits until the shard has at least one undelivered record.
    pub async fn wait_for_records(&self, shard_id: u32) -> Result<()> {
        let shard = self.shard(shard_id)?;
        loop {
            let notified = shard.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let pending = shard.state.lock()?.pending();
            if pending > 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Waits until every shard's checkpoint has caught up with its log.
    ///
    /// Consumers publish new records while processing, so a pass only counts
    /// when nothing was appended anywhere while it ran. Returns `false` if
    /// `timeout` elapsed first.
    pub async fn wait_until_drained(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            let appended_before = self.total_appended()?;
            let mut waited = false;
            for shard in &self.shards {
                loop {
                    let notified = shard.acknowledged.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    let pending = shard.state.lock()?.pending();
                    if pending == 0 {
                        break;
                    }
                    waited = true;
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(false);
                    }
                }
            }
            if !waited && self.total_appended()? == appended_before {
                return Ok(true);
            }
        }
    }

    /// Poisons a shard lock so every later access to it fails.
    #[cfg(test)]
    pub(crate) fn poison_shard(&self, shard_id: u32) {
        if let Some(shard) = self.shards.get(shard_id as usize) {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let _guard = shard.state.lock();
                panic!("poisoning shard {}", shard_id);
            }));
        }
    }

    fn total_appended(&self) -> Result<u64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.state.lock()?.end_offset();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Item;

    fn record(sequence: u64, sort: &str) -> ChangeRecord {
        ChangeRecord::for_mutation(
            sequence,
            ItemKey::new("OWNER#a", sort),
            None,
            Some(Item::new().with("deleted", false)),
        )
        .unwrap()
    }

    #[test]
    fn test_fetch_does_not_consume() {
        let feed = ChangeFeed::new(1);
        feed.publish(record(1, "ENTITY#e1")).unwrap();
        feed.publish(record(2, "ENTITY#e2")).unwrap();

        let first = feed.fetch(0, 10).unwrap();
        let again = feed.fetch(0, 10).unwrap();
        assert_eq!(first, again);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].offset, 1);
    }

    #[test]
    fn test_acknowledge_in_order() {
        let feed = ChangeFeed::new(1);
        feed.publish(record(1, "ENTITY#e1")).unwrap();
        feed.publish(record(2, "ENTITY#e2")).unwrap();

        assert!(feed.acknowledge(0, 1).is_err());
        feed.acknowledge(0, 0).unwrap();
        feed.acknowledge(0, 0).unwrap();
        assert_eq!(feed.pending(0).unwrap(), 1);
        assert_eq!(feed.fetch(0, 10).unwrap()[0].record.sequence, 2);
    }

    #[test]
    fn test_rewind_redelivers() {
        let feed = ChangeFeed::new(1);
        feed.publish(record(1, "ENTITY#e1")).unwrap();
        feed.acknowledge(0, 0).unwrap();
        assert_eq!(feed.pending(0).unwrap(), 0);

        feed.rewind(0, 0).unwrap();
        assert_eq!(feed.pending(0).unwrap(), 1);
        assert!(feed.rewind(0, 5).is_err());
    }

    #[test]
    fn test_compact_drops_acknowledged() {
        let feed = ChangeFeed::new(1);
        feed.publish(record(1, "ENTITY#e1")).unwrap();
        feed.publish(record(2, "ENTITY#e2")).unwrap();
        feed.acknowledge(0, 0).unwrap();

        assert_eq!(feed.compact(0).unwrap(), 1);
        let position = feed.position(0).unwrap();
        assert_eq!(position.checkpoint, 1);
        assert_eq!(position.retained, 1);
        assert!(feed.rewind(0, 0).is_err());
        assert_eq!(feed.fetch(0, 10).unwrap()[0].offset, 1);
    }

    #[test]
    fn test_same_key_same_shard() {
        let feed = ChangeFeed::new(8);
        let key = ItemKey::new("OWNER#a", "ENTITY#e1");
        let a = feed.publish(record(1, "ENTITY#e1")).unwrap();
        let b = feed.publish(record(2, "ENTITY#e1")).unwrap();
        assert_eq!(a, b);

        let deliveries = feed.deliveries_for_key(&key).unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries[0].record.sequence < deliveries[1].record.sequence);
    }

    #[tokio::test]
    async fn test_wait_until_drained() {
        let feed = std::sync::Arc::new(ChangeFeed::new(2));
        assert!(feed.wait_until_drained(Duration::from_millis(10)).await.unwrap());

        let shard = feed.publish(record(1, "ENTITY#e1")).unwrap();
        assert!(!feed.wait_until_drained(Duration::from_millis(20)).await.unwrap());

        let acker = feed.clone();
        let handle = tokio::spawn(async move {
            acker.wait_for_records(shard).await.unwrap();
            let batch = acker.fetch(shard, 1).unwrap();
            acker.acknowledge(shard, batch[0].offset).unwrap();
        });
        assert!(feed.wait_until_drained(Duration::from_secs(2)).await.unwrap());
        handle.await.unwrap();
    }
}
