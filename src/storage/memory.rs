// ============================================================================
// In-Memory Entity Store
// ============================================================================
//
// Serializable single-writer commits: every write takes the item map's write
// lock, evaluates all preconditions against the current images, then applies
// all operations. Nothing is written unless every condition holds.
//
// Committed mutations are published to the attached change feed while the
// write lock is still held, so feed order per key equals commit order.
// ============================================================================

use super::condition::{Condition, ConditionedOp, UpdateAction};
use super::engine::EntityStore;
use super::item::Item;
use super::keys::ItemKey;
use crate::core::{QuotaError, Result};
use crate::feed::{ChangeFeed, ChangeRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{Level, event};

/// Default cap on operations per transaction.
pub const DEFAULT_MAX_TRANSACTION_ITEMS: usize = 100;

/// Which store call an injected fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    TransactWrite,
    ConditionalWrite,
    AtomicAdd,
    AnyWrite,
}

impl FaultPoint {
    fn matches(&self, call: FaultPoint) -> bool {
        *self == FaultPoint::AnyWrite || *self == call
    }
}

/// Failure an injected fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    Conflict,
    Transient,
}

#[derive(Debug)]
struct InjectedFault {
    point: FaultPoint,
    fault: StoreFault,
    remaining: u32,
}

/// Counters describing what the store has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub commits: u64,
    pub precondition_failures: u64,
    pub injected_failures: u64,
    pub records_published: u64,
}

#[derive(Default)]
struct StoreCounters {
    commits: AtomicU64,
    precondition_failures: AtomicU64,
    injected_failures: AtomicU64,
    records_published: AtomicU64,
}

pub struct InMemoryEntityStore {
    items: RwLock<BTreeMap<ItemKey, Item>>,
    feed: Option<Arc<ChangeFeed>>,
    faults: Mutex<Vec<InjectedFault>>,
    next_sequence: AtomicU64,
    max_transaction_items: usize,
    counters: StoreCounters,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            feed: None,
            faults: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            max_transaction_items: DEFAULT_MAX_TRANSACTION_ITEMS,
            counters: StoreCounters::default(),
        }
    }

    /// Creates a store that publishes every committed mutation to `feed`.
    pub fn with_feed(feed: Arc<ChangeFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::new()
        }
    }

    pub fn max_transaction_items(mut self, max: usize) -> Self {
        self.max_transaction_items = max.max(1);
        self
    }

    pub fn feed(&self) -> Option<&Arc<ChangeFeed>> {
        self.feed.as_ref()
    }

    /// Makes the next `times` matching calls fail before touching any item.
    pub fn inject_fault(&self, point: FaultPoint, fault: StoreFault, times: u32) -> Result<()> {
        let mut faults = self.faults.lock()?;
        faults.push(InjectedFault {
            point,
            fault,
            remaining: times,
        });
        Ok(())
    }

    pub fn clear_faults(&self) -> Result<()> {
        self.faults.lock()?.clear();
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            commits: self.counters.commits.load(Ordering::SeqCst),
            precondition_failures: self.counters.precondition_failures.load(Ordering::SeqCst),
            injected_failures: self.counters.injected_failures.load(Ordering::SeqCst),
            records_published: self.counters.records_published.load(Ordering::SeqCst),
        }
    }

    /// Number of stored items.
    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    /// Copy of every stored item, in key order.
    pub async fn dump(&self) -> Vec<(ItemKey, Item)> {
        self.items
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn take_fault(&self, call: FaultPoint) -> Result<()> {
        let mut faults = self.faults.lock()?;
        let Some(position) = faults
            .iter()
            .position(|f| f.remaining > 0 && f.point.matches(call))
        else {
            return Ok(());
        };

        let injected = &mut faults[position];
        injected.remaining -= 1;
        let fault = injected.fault;
        faults.retain(|f| f.remaining > 0);
        self.counters.injected_failures.fetch_add(1, Ordering::SeqCst);

        Err(match fault {
            StoreFault::Conflict => QuotaError::TransactionConflict(format!(
                "injected conflict on {:?}",
                call
            )),
            StoreFault::Transient => {
                QuotaError::Transient(format!("injected transient failure on {:?}", call))
            }
        })
    }

    fn validate(&self, ops: &[ConditionedOp]) -> Result<()> {
        if ops.is_empty() {
            return Err(QuotaError::Validation(
                "transaction must contain at least one operation".into(),
            ));
        }
        if ops.len() > self.max_transaction_items {
            return Err(QuotaError::Validation(format!(
                "transaction has {} operations, limit is {}",
                ops.len(),
                self.max_transaction_items
            )));
        }
        let mut seen = HashSet::with_capacity(ops.len());
        for op in ops {
            if !seen.insert(op.key()) {
                return Err(QuotaError::Validation(format!(
                    "transaction touches item {} more than once",
                    op.key()
                )));
            }
        }
        Ok(())
    }

    /// Evaluates, applies and publishes `ops` atomically.
    ///
    /// Returns the post-image of every operation, in order.
    async fn commit(&self, call: FaultPoint, ops: Vec<ConditionedOp>) -> Result<Vec<Option<Item>>> {
        self.take_fault(call)?;
        self.validate(&ops)?;

        let mut items = self.items.write().await;

        for (index, op) in ops.iter().enumerate() {
            if let Some(condition) = op.condition() {
                if !condition.evaluate(items.get(op.key())) {
                    self.counters
                        .precondition_failures
                        .fetch_add(1, Ordering::SeqCst);
                    event!(
                        Level::DEBUG,
                        index,
                        key = %op.key(),
                        op = op.kind(),
                        condition = %condition,
                        "store precondition failed"
                    );
                    return Err(QuotaError::PreconditionFailed {
                        index,
                        key: op.key().to_string(),
                    });
                }
            }
        }

        // Compute every image before writing anything so a failing action
        // leaves the map untouched.
        let mut staged = Vec::with_capacity(ops.len());
        for op in &ops {
            let before = items.get(op.key()).cloned();
            let after = op.apply(before.as_ref())?;
            staged.push((op, before, after));
        }

        let mut post_images = Vec::with_capacity(staged.len());
        let mut records = Vec::new();
        for (op, before, after) in staged {
            if !matches!(op, ConditionedOp::ConditionCheck { .. }) {
                match &after {
                    Some(item) => {
                        items.insert(op.key().clone(), item.clone());
                    }
                    None => {
                        items.remove(op.key());
                    }
                }
                let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
                if let Some(record) =
                    ChangeRecord::for_mutation(sequence, op.key().clone(), before, after.clone())
                {
                    records.push(record);
                }
            }
            post_images.push(after);
        }

        self.counters.commits.fetch_add(1, Ordering::SeqCst);

        // The items are written at this point; a publish failure must not be
        // retried as if nothing had happened.
        if let Some(feed) = &self.feed {
            for record in records {
                let key = record.key.clone();
                if let Err(err) = feed.publish(record) {
                    event!(
                        Level::ERROR,
                        key = %key,
                        error = %err,
                        "change record lost after commit"
                    );
                    return Err(QuotaError::ExecutionError(format!(
                        "write to {} committed but was not published: {}",
                        key, err
                    )));
                }
                self.counters.records_published.fetch_add(1, Ordering::SeqCst);
            }
        }

        Ok(post_images)
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn transact_write(&self, ops: Vec<ConditionedOp>) -> Result<()> {
        self.commit(FaultPoint::TransactWrite, ops).await?;
        Ok(())
    }

    async fn conditional_write(&self, op: ConditionedOp) -> Result<()> {
        self.commit(FaultPoint::ConditionalWrite, vec![op]).await?;
        Ok(())
    }

    async fn atomic_add(
        &self,
        key: &ItemKey,
        attr: &str,
        delta: i64,
        precondition: Option<Condition>,
    ) -> Result<i64> {
        let op = ConditionedOp::Update {
            key: key.clone(),
            actions: vec![UpdateAction::add(attr, delta)],
            condition: precondition,
        };
        let mut images = self.commit(FaultPoint::AtomicAdd, vec![op]).await?;
        let image = images.pop().flatten().ok_or_else(|| {
            QuotaError::ExecutionError(format!("atomic add on {} produced no item", key))
        })?;
        image.require_int(attr)
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<Item>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn query_partition(
        &self,
        partition: &str,
        sort_prefix: &str,
    ) -> Result<Vec<(ItemKey, Item)>> {
        let items = self.items.read().await;
        let start = ItemKey::new(partition, sort_prefix);
        Ok(items
            .range(start..)
            .take_while(|(key, _)| key.partition == partition && key.sort.starts_with(sort_prefix))
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect())
    }
}
