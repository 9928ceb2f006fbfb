// ============================================================================
// quotacount Library
// ============================================================================
//
// Dual-counter quota engine for owners and their owned entities:
//
//   write path   QuotaGate ──> CounterLedger ──> EntityStore
//                                                    │ committed mutations
//   async path   FeedWorkerPool <── ChangeFeed <─────┘
//                      │
//                      └──> ReconciliationProcessor ──> reconciliation counter
//
// The ledger counter is exact at commit time but contended; the
// reconciliation counter is rebuilt from the feed and heals drift. The gate
// admits against the larger of the two.
// ============================================================================

pub mod config;
pub mod core;
pub mod counter;
pub mod entity;
pub mod feed;
pub mod reconcile;
pub mod service;
pub mod storage;

pub use config::{AdmissionMode, FeedConfig, QuotaConfig, RetryPolicy};
pub use core::{CounterType, EntityId, ErrorClass, OwnerId, ProcessError, QuotaError, Result};
pub use counter::{AdmissionDecision, CounterLedger, QuotaGate, SoftDeleteOutcome, Verdict};
pub use entity::{LifecycleEvent, LifecycleState, OwnedEntity, Owner, ReconciliationCounter};
pub use feed::{ChangeFeed, ChangeRecord, EventKind, FeedWorkerPool, InMemoryDeadLetterQueue};
pub use reconcile::{ReconciliationProcessor, RecordOutcome};
pub use service::OwnedEntityService;
pub use storage::{EntityStore, InMemoryEntityStore};

use std::sync::Arc;

/// A fully wired in-memory engine: store, change feed, write-path service and
/// the reconciliation workers.
///
/// # Examples
///
/// ```no_run
/// use quotacount::{OwnerId, QuotaConfig, QuotaEngine};
///
/// # async fn demo() -> quotacount::Result<()> {
/// let engine = QuotaEngine::start(QuotaConfig::default())?;
/// let owner = OwnerId::new("acct-1")?;
/// engine.service().create_owner(owner.clone(), Some(5)).await?;
/// engine.service().create_entity(&owner, "api").await?;
/// engine.settle(std::time::Duration::from_secs(1)).await?;
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct QuotaEngine {
    store: Arc<InMemoryEntityStore>,
    feed: Arc<ChangeFeed>,
    service: OwnedEntityService,
    workers: FeedWorkerPool,
    dead_letters: Arc<InMemoryDeadLetterQueue>,
}

impl QuotaEngine {
    /// Builds the engine and spawns one feed worker per shard.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: QuotaConfig) -> Result<Self> {
        config.validate()?;
        let feed = Arc::new(ChangeFeed::new(config.feed.shard_count));
        let store = Arc::new(
            InMemoryEntityStore::with_feed(feed.clone())
                .max_transaction_items(config.max_transaction_items),
        );
        let processor = Arc::new(ReconciliationProcessor::new(
            store.clone(),
            config.counter_kind()?,
        ));
        let dead_letters = Arc::new(InMemoryDeadLetterQueue::new());
        let workers = FeedWorkerPool::spawn(
            feed.clone(),
            processor,
            dead_letters.clone(),
            config.feed.clone(),
        );
        let service = OwnedEntityService::new(store.clone(), config)?;

        Ok(Self {
            store,
            feed,
            service,
            workers,
            dead_letters,
        })
    }

    pub fn service(&self) -> &OwnedEntityService {
        &self.service
    }

    pub fn store(&self) -> &Arc<InMemoryEntityStore> {
        &self.store
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    pub fn dead_letters(&self) -> &Arc<InMemoryDeadLetterQueue> {
        &self.dead_letters
    }

    pub fn worker_stats(&self) -> feed::FeedWorkerStats {
        self.workers.stats()
    }

    /// Waits for the workers to catch up with every published record.
    pub async fn settle(&self, timeout: std::time::Duration) -> Result<bool> {
        self.feed.wait_until_drained(timeout).await
    }

    /// Stops the workers and returns their final counters.
    pub async fn shutdown(self) -> Result<feed::FeedWorkerStats> {
        self.workers.stop().await
    }
}
