#![allow(dead_code)]

use quotacount::feed::ChangeFeed;
use quotacount::storage::{EntityStore, InMemoryEntityStore, ItemKey};
use quotacount::{
    CounterType, OwnedEntityService, OwnerId, QuotaConfig, ReconciliationProcessor, RecordOutcome,
};
use std::sync::Arc;

pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("quotacount=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

/// Store, feed, service and processor wired together without background
/// workers, so tests decide when and how often records are delivered.
pub struct Harness {
    pub feed: Arc<ChangeFeed>,
    pub store: Arc<InMemoryEntityStore>,
    pub service: Arc<OwnedEntityService>,
    pub processor: ReconciliationProcessor,
}

impl Harness {
    pub fn new(config: QuotaConfig) -> Self {
        init_test_logging();
        let feed = Arc::new(ChangeFeed::new(config.feed.shard_count));
        let store = Arc::new(InMemoryEntityStore::with_feed(feed.clone()));
        let processor = ReconciliationProcessor::new(store.clone(), CounterType::default());
        let service = Arc::new(OwnedEntityService::new(store.clone(), config).unwrap());
        Self {
            feed,
            store,
            service,
            processor,
        }
    }

    /// Processes every pending record, each `deliveries` times, acknowledging
    /// after the last delivery. Records produced while draining are drained too.
    pub async fn drain(&self, deliveries: usize) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::new();
        while self.feed.total_pending().unwrap() > 0 {
            for shard in 0..self.feed.shard_count() {
                for delivery in self.feed.fetch(shard, 64).unwrap() {
                    for _ in 0..deliveries.max(1) {
                        outcomes.push(self.processor.process_record(&delivery.record).await.unwrap());
                    }
                    self.feed.acknowledge(shard, delivery.offset).unwrap();
                }
            }
        }
        outcomes
    }

    pub async fn reconciled_count(&self, owner_id: &OwnerId) -> i64 {
        let key = ItemKey::counter(owner_id, &CounterType::default());
        match self.store.get(&key).await.unwrap() {
            Some(item) => item.require_int("count_value").unwrap(),
            None => 0,
        }
    }

    pub async fn ledger_count(&self, owner_id: &OwnerId) -> i64 {
        self.service.get_owner(owner_id).await.unwrap().ledger_count
    }
}

pub fn owner(id: &str) -> OwnerId {
    OwnerId::new(id).unwrap()
}
