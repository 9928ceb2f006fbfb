/// Quota admission tests
///
/// Concurrent create paths, both admission modes and the ledger floor.
/// Run with: cargo test --test quota_admission_tests
mod common;

use common::{Harness, owner};
use quotacount::storage::{EntityStore, ItemKey};
use quotacount::{AdmissionMode, CounterType, OwnedEntity, QuotaConfig, QuotaError, Verdict};
use std::sync::Arc;
use tokio::sync::Barrier;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_admitted_creates_overshoot_then_gate_denies() {
    let h = Harness::new(QuotaConfig::default());
    let owner_id = owner("acct-1");
    h.service.create_owner(owner_id.clone(), Some(1)).await.unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = vec![];
    for i in 0..2 {
        let service = h.service.clone();
        let barrier = barrier.clone();
        let owner_id = owner_id.clone();
        handles.push(tokio::spawn(async move {
            let decision = service.gate().admit(&owner_id).await.unwrap();
            // Both requests read before either commits.
            barrier.wait().await;
            assert_eq!(decision.effective, 0);
            assert_eq!(decision.verdict, Verdict::Allow);

            let entity = OwnedEntity::new(owner_id, format!("svc-{}", i));
            service.ledger().create_with_ledger_increment(&entity).await
        }));
    }
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    assert_eq!(h.ledger_count(&owner_id).await, 2);
    let decision = h.service.admission(&owner_id).await.unwrap();
    assert_eq!(decision.effective, 2);
    assert_eq!(decision.verdict, Verdict::Deny);

    let err = assert_err!(h.service.create_entity(&owner_id, "late").await);
    assert!(matches!(
        err,
        QuotaError::QuotaExceeded {
            effective: 2,
            quota_max: 1,
            ..
        }
    ));

    h.drain(1).await;
    assert_eq!(h.reconciled_count(&owner_id).await, 2);
    assert!(!h.service.admission(&owner_id).await.unwrap().is_allowed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transactional_admission_holds_the_ledger_at_quota() {
    let h = Harness::new(QuotaConfig::default().admission(AdmissionMode::Transactional));
    let owner_id = owner("acct-1");
    h.service.create_owner(owner_id.clone(), Some(1)).await.unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = vec![];
    for i in 0..2 {
        let service = h.service.clone();
        let barrier = barrier.clone();
        let owner_id = owner_id.clone();
        handles.push(tokio::spawn(async move {
            assert!(service.gate().admit(&owner_id).await.unwrap().is_allowed());
            barrier.wait().await;
            let entity = OwnedEntity::new(owner_id, format!("svc-{}", i));
            service.ledger().create_with_ledger_increment(&entity).await
        }));
    }

    let mut created = 0;
    let mut denied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => created += 1,
            Err(QuotaError::QuotaExceeded { .. }) => denied += 1,
            Err(err) => panic!("unexpected error: {}", err),
        }
    }
    assert_eq!((created, denied), (1, 1));
    assert_eq!(h.ledger_count(&owner_id).await, 1);
    assert_eq!(h.service.list_entities(&owner_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_stay_within_overshoot_bound() {
    let quota_max = 3;
    let concurrency = 8;
    let h = Harness::new(QuotaConfig::default());
    let owner_id = owner("acct-1");
    h.service
        .create_owner(owner_id.clone(), Some(quota_max))
        .await
        .unwrap();

    let barrier = Arc::new(Barrier::new(concurrency));
    let mut handles = vec![];
    for i in 0..concurrency {
        let service = h.service.clone();
        let barrier = barrier.clone();
        let owner_id = owner_id.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            service.create_entity(&owner_id, format!("svc-{}", i)).await
        }));
    }

    let mut created = 0i64;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(QuotaError::QuotaExceeded { .. }) => {}
            Err(err) => panic!("unexpected error: {}", err),
        }
    }

    assert!(created >= quota_max);
    assert!(created <= quota_max + concurrency as i64);
    assert_eq!(h.ledger_count(&owner_id).await, created);
    assert_err!(h.service.create_entity(&owner_id, "after").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ledger_never_goes_negative() {
    let h = Harness::new(QuotaConfig::default());
    let owner_id = owner("acct-1");
    h.service.create_owner(owner_id.clone(), Some(10)).await.unwrap();

    let mut entities = Vec::new();
    for i in 0..4 {
        entities.push(h.service.create_entity(&owner_id, format!("svc-{}", i)).await.unwrap());
    }
    // The ledger was already corrected downward by other means.
    h.store
        .atomic_add(&ItemKey::owner(&owner_id), "ledger_count", -3, None)
        .await
        .unwrap();

    let mut handles = vec![];
    for entity in entities {
        let service = h.service.clone();
        let owner_id = owner_id.clone();
        handles.push(tokio::spawn(async move {
            service.delete_entity(&owner_id, &entity.id).await
        }));
    }

    let mut decremented = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().ledger_decremented {
            decremented += 1;
        }
    }
    assert_eq!(decremented, 1);
    assert_eq!(h.ledger_count(&owner_id).await, 0);
    assert!(h.service.list_entities(&owner_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_gate_uses_the_larger_counter() {
    let h = Harness::new(QuotaConfig::default());
    let owner_id = owner("acct-1");
    h.service.create_owner(owner_id.clone(), Some(2)).await.unwrap();
    h.service.create_entity(&owner_id, "api").await.unwrap();
    h.drain(1).await;

    // Ledger lost track of the entity; reconciliation still sees it.
    h.store
        .atomic_add(&ItemKey::owner(&owner_id), "ledger_count", -1, None)
        .await
        .unwrap();
    let decision = h.service.admission(&owner_id).await.unwrap();
    assert_eq!((decision.ledger_count, decision.reconciled_count), (0, 1));
    assert_eq!(decision.effective, 1);
    assert!(decision.is_allowed());

    h.store
        .atomic_add(
            &ItemKey::counter(&owner_id, &CounterType::default()),
            "count_value",
            1,
            None,
        )
        .await
        .unwrap();
    let decision = h.service.admission(&owner_id).await.unwrap();
    assert_eq!(decision.effective, 2);
    assert_eq!(decision.verdict, Verdict::Deny);
}

#[tokio::test]
async fn test_zero_quota_denies_everything() {
    let h = Harness::new(QuotaConfig::default());
    let owner_id = owner("acct-1");
    h.service.create_owner(owner_id.clone(), Some(0)).await.unwrap();
    assert!(matches!(
        h.service.create_entity(&owner_id, "api").await,
        Err(QuotaError::QuotaExceeded { quota_max: 0, .. })
    ));
    assert_eq!(h.ledger_count(&owner_id).await, 0);
}

#[tokio::test]
async fn test_unknown_owner_is_not_found_not_zero() {
    let h = Harness::new(QuotaConfig::default());
    let owner_id = owner("ghost");
    assert!(matches!(
        h.service.admission(&owner_id).await,
        Err(QuotaError::NotFound { kind: "Owner", .. })
    ));
    assert!(matches!(
        h.service.delete_all_entities(&owner_id).await,
        Err(QuotaError::NotFound { .. })
    ));
}
