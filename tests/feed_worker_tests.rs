/// Feed worker tests
///
/// End-to-end runs with background shard workers: convergence, redelivery
/// after store failures and dead-lettering.
/// Run with: cargo test --test feed_worker_tests
mod common;

use async_trait::async_trait;
use common::{init_test_logging, owner};
use quotacount::feed::{ChangeRecord, DeadLetter, DeadLetterSink, FeedWorkerPool};
use quotacount::storage::keys::ENTITY_PREFIX;
use quotacount::storage::{EntityStore, FaultPoint, Item, ItemKey, StoreFault};
use quotacount::{
    ChangeFeed, CounterType, InMemoryEntityStore, QuotaConfig, QuotaEngine, QuotaError,
    ReconciliationProcessor,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

const SETTLE: Duration = Duration::from_secs(5);

fn fast_config() -> QuotaConfig {
    let mut config = QuotaConfig::default().shard_count(3).default_quota_max(20);
    config.feed.retry_base_backoff_ms = 1;
    config.feed.retry_max_backoff_ms = 10;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_counters_converge() {
    init_test_logging();
    let engine = QuotaEngine::start(fast_config()).unwrap();
    let owner_id = owner("acct-1");
    engine.service().create_owner(owner_id.clone(), None).await.unwrap();

    let mut entities = Vec::new();
    for i in 0..10 {
        entities.push(
            engine
                .service()
                .create_entity(&owner_id, format!("svc-{}", i))
                .await
                .unwrap(),
        );
    }
    for entity in entities.iter().step_by(3) {
        engine.service().delete_entity(&owner_id, &entity.id).await.unwrap();
    }

    assert!(engine.settle(SETTLE).await.unwrap());

    let decision = engine.service().admission(&owner_id).await.unwrap();
    assert_eq!(decision.ledger_count, 6);
    assert_eq!(decision.reconciled_count, 6);

    let counters = engine.service().list_counters(&owner_id).await.unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].count_value, 6);

    let remaining_entities = engine
        .store()
        .dump()
        .await
        .into_iter()
        .filter(|(key, _)| key.sort.starts_with(ENTITY_PREFIX))
        .count();
    assert_eq!(remaining_entities, 6);

    let stats = engine.shutdown().await.unwrap();
    assert_eq!(stats.dead_lettered, 0);
    assert!(stats.applied >= 14);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_processed_records_do_not_accumulate() {
    init_test_logging();
    let engine = QuotaEngine::start(fast_config().default_quota_max(100)).unwrap();
    let owner_id = owner("acct-1");
    engine.service().create_owner(owner_id.clone(), None).await.unwrap();
    for i in 0..50 {
        engine
            .service()
            .create_entity(&owner_id, format!("svc-{}", i))
            .await
            .unwrap();
    }

    assert!(engine.settle(SETTLE).await.unwrap());
    let feed = engine.feed().clone();
    let stats = engine.shutdown().await.unwrap();
    assert_eq!(stats.applied, 50);

    let retained: usize = (0..feed.shard_count())
        .map(|shard| feed.position(shard).unwrap().retained)
        .sum();
    assert_eq!(retained, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_redeliver_after_store_failures() {
    init_test_logging();
    let engine = QuotaEngine::start(fast_config()).unwrap();
    let owner_id = owner("acct-1");
    engine.service().create_owner(owner_id.clone(), None).await.unwrap();

    let mut entities = Vec::new();
    for i in 0..4 {
        entities.push(
            engine
                .service()
                .create_entity(&owner_id, format!("svc-{}", i))
                .await
                .unwrap(),
        );
    }
    assert!(engine.settle(SETTLE).await.unwrap());

    // Removal is the only conditional write, so these hit the workers.
    engine
        .store()
        .inject_fault(FaultPoint::ConditionalWrite, StoreFault::Transient, 2)
        .unwrap();
    for entity in &entities[..2] {
        engine.service().delete_entity(&owner_id, &entity.id).await.unwrap();
    }

    assert!(engine.settle(SETTLE).await.unwrap());
    let decision = engine.service().admission(&owner_id).await.unwrap();
    assert_eq!(decision.reconciled_count, 2);
    assert_eq!(decision.ledger_count, 2);
    for entity in &entities[..2] {
        assert!(engine.store().get(&entity.key()).await.unwrap().is_none());
    }

    let stats = engine.shutdown().await.unwrap();
    assert!(stats.retries >= 2);
    assert!(stats.duplicates >= 1);
}

#[tokio::test]
async fn test_malformed_record_goes_to_dead_letter_queue() {
    init_test_logging();
    let engine = QuotaEngine::start(fast_config()).unwrap();

    let bad = ChangeRecord::for_mutation(
        10_000,
        ItemKey::new("OWNER#", "ENTITY#e1"),
        None,
        Some(Item::new().with("deleted", false)),
    )
    .unwrap();
    engine.feed().publish(bad.clone()).unwrap();

    assert!(engine.settle(SETTLE).await.unwrap());
    let letters = engine.dead_letters().list().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].record, bad);
    assert!(letters[0].error.contains("Malformed"));

    let stats = engine.shutdown().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
}

/// Sink that refuses the first few letters.
struct FlakySink {
    failures_left: AtomicU32,
    accepted: Mutex<Vec<DeadLetter>>,
}

#[async_trait]
impl DeadLetterSink for FlakySink {
    async fn send(&self, letter: DeadLetter) -> quotacount::Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QuotaError::Transient("sink unavailable".into()));
        }
        self.accepted.lock().await.push(letter);
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_failure_keeps_record_until_accepted() {
    init_test_logging();
    let feed = Arc::new(ChangeFeed::new(1));
    let store = Arc::new(InMemoryEntityStore::with_feed(feed.clone()));
    let processor = Arc::new(ReconciliationProcessor::new(store, CounterType::default()));
    let sink = Arc::new(FlakySink {
        failures_left: AtomicU32::new(2),
        accepted: Mutex::new(Vec::new()),
    });
    let pool = FeedWorkerPool::spawn(feed.clone(), processor, sink.clone(), fast_config().feed);

    let bad =
        ChangeRecord::for_mutation(1, ItemKey::new("OWNER#", "ENTITY#x"), None, Some(Item::new()))
            .unwrap();
    feed.publish(bad).unwrap();

    assert!(feed.wait_until_drained(SETTLE).await.unwrap());
    assert_eq!(sink.accepted.lock().await.len(), 1);

    let stats = pool.stop().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn test_stop_leaves_unprocessed_records_on_the_feed() {
    init_test_logging();
    let engine = QuotaEngine::start(fast_config()).unwrap();
    let feed = engine.feed().clone();
    engine.shutdown().await.unwrap();

    let record =
        ChangeRecord::for_mutation(1, ItemKey::new("OWNER#a", "METADATA"), None, Some(Item::new()))
            .unwrap();
    feed.publish(record).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(feed.total_pending().unwrap(), 1);
}
