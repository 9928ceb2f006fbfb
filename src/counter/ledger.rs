// ============================================================================
// Counter Ledger
// ============================================================================
//
// Synchronous counter kept on the owner record. Every change to
// `ledger_count` happens inside the same store transaction as the entity
// write it accounts for:
//
//   create       [put entity    | not exists        ]
//                [owner += 1    | exists (+ ledger_count < quota_max)]
//
//   soft delete  [entity.deleted = true | exists, not deleted]
//                [owner -= 1            | ledger_count > 0   ]
//
// When the floor guard fails the soft delete is re-issued without the
// decrement, so `ledger_count` never goes below zero.
// ============================================================================

use super::retry::with_retry;
use crate::config::{AdmissionMode, QuotaConfig, RetryPolicy};
use crate::core::{CounterType, EntityId, OwnerId, QuotaError, Result};
use crate::entity::records::{ATTR_LEDGER_COUNT, ATTR_QUOTA_MAX};
use crate::entity::{LifecycleEvent, LifecycleState, OwnedEntity, Owner, ReconciliationCounter};
use crate::storage::keys::{ENTITY_PREFIX, owner_partition};
use crate::storage::{Condition, ConditionedOp, EntityStore, ItemKey, UpdateAction};
use log::info;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Result of a single soft delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftDeleteOutcome {
    pub entity_id: EntityId,
    /// `false` when the floor guard suppressed the ledger decrement.
    pub ledger_decremented: bool,
}

/// Result of soft-deleting every live entity of an owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkDeleteOutcome {
    pub deleted: usize,
    pub ledger_decremented: usize,
    pub batches: usize,
}

pub struct CounterLedger {
    store: Arc<dyn EntityStore>,
    counter_type: CounterType,
    admission: AdmissionMode,
    retry: RetryPolicy,
    delete_batch_size: usize,
}

impl CounterLedger {
    pub fn new(store: Arc<dyn EntityStore>, config: &QuotaConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            counter_type: config.counter_kind()?,
            admission: config.admission,
            retry: config.retry.clone(),
            delete_batch_size: config.delete_batch_size,
        })
    }

    pub fn admission(&self) -> AdmissionMode {
        self.admission
    }

    async fn transact(&self, label: &str, ops: Vec<ConditionedOp>) -> Result<()> {
        with_retry(&self.retry, label, || {
            let store = self.store.clone();
            let ops = ops.clone();
            async move { store.transact_write(ops).await }
        })
        .await
    }

    /// Reads the owner record; a missing owner is `NotFound`.
    pub async fn get_owner(&self, owner_id: &OwnerId) -> Result<Owner> {
        match self.store.get(&ItemKey::owner(owner_id)).await? {
            Some(item) => Owner::from_item(&item),
            None => Err(QuotaError::not_found("Owner", owner_id)),
        }
    }

    /// Creates an owner together with its zeroed reconciliation counter.
    pub async fn create_owner(&self, owner_id: OwnerId, quota_max: i64) -> Result<Owner> {
        if quota_max < 0 {
            return Err(QuotaError::Validation(format!(
                "quota_max must be >= 0, got {}",
                quota_max
            )));
        }

        let owner = Owner::new(owner_id, quota_max);
        let counter = ReconciliationCounter::new(owner.id.clone(), self.counter_type.clone());
        let ops = vec![
            ConditionedOp::Put {
                key: owner.key(),
                item: owner.to_item(),
                condition: Some(Condition::NotExists),
            },
            ConditionedOp::Put {
                key: counter.key(),
                item: counter.to_item(),
                condition: Some(Condition::NotExists),
            },
        ];

        let span = info_span!("ledger.create_owner", owner_id = %owner.id, quota_max);
        match self.transact("ledger.create_owner", ops).instrument(span).await {
            Ok(()) => Ok(owner),
            Err(err) if err.is_precondition_failed() => Err(QuotaError::AlreadyExists {
                kind: "Owner",
                id: owner.id.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    /// Creates `entity` and adds one to its owner's `ledger_count`, atomically.
    ///
    /// In `Transactional` admission mode the owner update also requires
    /// `ledger_count < quota_max` at commit time.
    pub async fn create_with_ledger_increment(&self, entity: &OwnedEntity) -> Result<()> {
        if entity.lifecycle()? != LifecycleState::Created {
            return Err(QuotaError::Validation(format!(
                "entity {} must be created with all lifecycle flags unset",
                entity.id
            )));
        }

        let mut owner_guard = Condition::Exists;
        if self.admission == AdmissionMode::Transactional {
            owner_guard = owner_guard.and(Condition::less_than_attr(
                ATTR_LEDGER_COUNT,
                ATTR_QUOTA_MAX,
            ));
        }
        let ops = vec![
            ConditionedOp::Put {
                key: entity.key(),
                item: entity.to_item(),
                condition: Some(Condition::NotExists),
            },
            ConditionedOp::Update {
                key: ItemKey::owner(&entity.owner_id),
                actions: vec![UpdateAction::add(ATTR_LEDGER_COUNT, 1)],
                condition: Some(owner_guard),
            },
        ];

        let span = info_span!(
            "ledger.create",
            owner_id = %entity.owner_id,
            entity_id = %entity.id,
            admission = ?self.admission
        );
        async move {
            match self.transact("ledger.create", ops).await {
                Ok(()) => {
                    event!(Level::DEBUG, "entity created, ledger incremented");
                    Ok(())
                }
                Err(err) => match err.failed_operation() {
                    Some(0) => Err(QuotaError::AlreadyExists {
                        kind: "OwnedEntity",
                        id: entity.id.to_string(),
                    }),
                    Some(_) => {
                        // Owner guard: either no owner or no quota left.
                        let owner = self.get_owner(&entity.owner_id).await?;
                        event!(
                            Level::INFO,
                            ledger_count = owner.ledger_count,
                            quota_max = owner.quota_max,
                            "ledger admission rejected at commit"
                        );
                        Err(QuotaError::QuotaExceeded {
                            owner_id: owner.id.to_string(),
                            effective: owner.ledger_count,
                            quota_max: owner.quota_max,
                        })
                    }
                    None => Err(err),
                },
            }
        }
        .instrument(span)
        .await
    }

    /// Marks an entity deleted and subtracts one from the ledger, atomically.
    ///
    /// A missing owner, or a missing or already deleted entity, is `NotFound`.
    /// If the ledger is already at zero the entity is still marked deleted and the outcome
    /// reports that no decrement happened.
    pub async fn soft_delete_with_ledger_decrement(
        &self,
        owner_id: &OwnerId,
        entity_id: &EntityId,
    ) -> Result<SoftDeleteOutcome> {
        let entity_key = ItemKey::entity(owner_id, entity_id);
        let soft_delete = ConditionedOp::Update {
            key: entity_key.clone(),
            actions: vec![LifecycleEvent::SoftDelete.flag_update()],
            condition: Some(LifecycleEvent::SoftDelete.guard()),
        };
        let ops = vec![
            soft_delete.clone(),
            ConditionedOp::Update {
                key: ItemKey::owner(owner_id),
                actions: vec![UpdateAction::add(ATTR_LEDGER_COUNT, -1)],
                condition: Some(Condition::greater_than(ATTR_LEDGER_COUNT, 0)),
            },
        ];

        let span = info_span!(
            "ledger.soft_delete",
            owner_id = %owner_id,
            entity_id = %entity_id
        );
        async move {
            let ledger_decremented = match self.transact("ledger.soft_delete", ops).await {
                Ok(()) => true,
                Err(err) => match err.failed_operation() {
                    Some(0) => return Err(QuotaError::not_found("OwnedEntity", entity_id)),
                    Some(_) => {
                        // The owner guard also fails when there is no owner.
                        self.get_owner(owner_id).await?;
                        info!(
                            "ledger for owner {} is already at its floor; soft-deleting {} without decrement",
                            owner_id, entity_id
                        );
                        match self.transact("ledger.soft_delete", vec![soft_delete]).await {
                            Ok(()) => false,
                            Err(err) if err.is_precondition_failed() => {
                                return Err(QuotaError::not_found("OwnedEntity", entity_id));
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    None => return Err(err),
                },
            };

            event!(Level::DEBUG, ledger_decremented, "entity soft-deleted");
            Ok(SoftDeleteOutcome {
                entity_id: entity_id.clone(),
                ledger_decremented,
            })
        }
        .instrument(span)
        .await
    }

    /// Soft-deletes every live entity of an owner in batches.
    ///
    /// Each batch is one transaction that flags its entities and subtracts the
    /// batch size from the ledger, guarded by `ledger_count >= batch size`.
    /// Entities deleted concurrently drop out of their batch.
    pub async fn soft_delete_all_for_owner(&self, owner_id: &OwnerId) -> Result<BulkDeleteOutcome> {
        self.get_owner(owner_id).await?;

        let span = info_span!("ledger.soft_delete_all", owner_id = %owner_id);
        async move {
            let mut live = Vec::new();
            for (_, item) in self
                .store
                .query_partition(&owner_partition(owner_id), ENTITY_PREFIX)
                .await?
            {
                let entity = OwnedEntity::from_item(&item)?;
                if !entity.deleted {
                    live.push(entity.id);
                }
            }

            let mut outcome = BulkDeleteOutcome::default();
            for chunk in live.chunks(self.delete_batch_size) {
                let (deleted, decremented) = self.soft_delete_batch(owner_id, chunk.to_vec()).await?;
                outcome.deleted += deleted;
                if decremented {
                    outcome.ledger_decremented += deleted;
                }
                outcome.batches += 1;
            }

            event!(
                Level::INFO,
                deleted = outcome.deleted,
                ledger_decremented = outcome.ledger_decremented,
                batches = outcome.batches,
                "owner entities soft-deleted"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn soft_delete_batch(
        &self,
        owner_id: &OwnerId,
        mut pending: Vec<EntityId>,
    ) -> Result<(usize, bool)> {
        let mut with_decrement = true;

        while !pending.is_empty() {
            let size = pending.len() as i64;
            let mut ops: Vec<ConditionedOp> = pending
                .iter()
                .map(|entity_id| ConditionedOp::Update {
                    key: ItemKey::entity(owner_id, entity_id),
                    actions: vec![LifecycleEvent::SoftDelete.flag_update()],
                    condition: Some(LifecycleEvent::SoftDelete.guard()),
                })
                .collect();
            if with_decrement {
                ops.push(ConditionedOp::Update {
                    key: ItemKey::owner(owner_id),
                    actions: vec![UpdateAction::add(ATTR_LEDGER_COUNT, -size)],
                    condition: Some(Condition::greater_or_equal(ATTR_LEDGER_COUNT, size)),
                });
            }

            match self.transact("ledger.soft_delete_batch", ops).await {
                Ok(()) => return Ok((pending.len(), with_decrement)),
                Err(err) => match err.failed_operation() {
                    Some(index) if index < pending.len() => {
                        // Deleted by someone else in the meantime.
                        pending.remove(index);
                    }
                    Some(_) => {
                        info!(
                            "ledger for owner {} is below batch size {}; soft-deleting batch without decrement",
                            owner_id, size
                        );
                        with_decrement = false;
                    }
                    None => return Err(err),
                },
            }
        }

        Ok((0, with_decrement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEntityStore;

    fn owner_id() -> OwnerId {
        OwnerId::new("acct-1").unwrap()
    }

    fn ledger(store: &Arc<InMemoryEntityStore>, config: QuotaConfig) -> CounterLedger {
        CounterLedger::new(store.clone(), &config).unwrap()
    }

    #[tokio::test]
    async fn test_create_owner_initialises_counter() {
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = ledger(&store, QuotaConfig::default());

        let owner = ledger.create_owner(owner_id(), 3).await.unwrap();
        assert_eq!(owner.ledger_count, 0);

        let counter_key = ItemKey::counter(&owner_id(), &CounterType::default());
        let counter = store.get(&counter_key).await.unwrap().unwrap();
        assert_eq!(counter.require_int("count_value").unwrap(), 0);

        let err = ledger.create_owner(owner_id(), 3).await.unwrap_err();
        assert!(matches!(err, QuotaError::AlreadyExists { kind: "Owner", .. }));
    }

    #[tokio::test]
    async fn test_create_increments_ledger() {
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = ledger(&store, QuotaConfig::default());
        ledger.create_owner(owner_id(), 3).await.unwrap();

        let entity = OwnedEntity::new(owner_id(), "svc");
        ledger.create_with_ledger_increment(&entity).await.unwrap();
        assert_eq!(ledger.get_owner(&owner_id()).await.unwrap().ledger_count, 1);

        let err = ledger.create_with_ledger_increment(&entity).await.unwrap_err();
        assert!(matches!(err, QuotaError::AlreadyExists { .. }));
        assert_eq!(ledger.get_owner(&owner_id()).await.unwrap().ledger_count, 1);
    }

    #[tokio::test]
    async fn test_create_for_missing_owner_is_not_found() {
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = ledger(&store, QuotaConfig::default());

        let entity = OwnedEntity::new(owner_id(), "svc");
        let err = ledger.create_with_ledger_increment(&entity).await.unwrap_err();
        assert!(matches!(err, QuotaError::NotFound { kind: "Owner", .. }));
        assert!(store.get(&entity.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_without_owner_is_not_found() {
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = ledger(&store, QuotaConfig::default());
        let entity = OwnedEntity::new(owner_id(), "orphan");
        store
            .conditional_write(ConditionedOp::Put {
                key: entity.key(),
                item: entity.to_item(),
                condition: None,
            })
            .await
            .unwrap();

        let err = ledger
            .soft_delete_with_ledger_decrement(&owner_id(), &entity.id)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::NotFound { kind: "Owner", .. }));

        let stored = store.get(&entity.key()).await.unwrap().unwrap();
        assert!(!OwnedEntity::from_item(&stored).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_transactional_mode_rejects_at_commit() {
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = ledger(
            &store,
            QuotaConfig::default().admission(AdmissionMode::Transactional),
        );
        ledger.create_owner(owner_id(), 1).await.unwrap();

        ledger
            .create_with_ledger_increment(&OwnedEntity::new(owner_id(), "a"))
            .await
            .unwrap();
        let second = OwnedEntity::new(owner_id(), "b");
        let err = ledger.create_with_ledger_increment(&second).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::QuotaExceeded {
                effective: 1,
                quota_max: 1,
                ..
            }
        ));
        assert!(store.get(&second.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_decrements_and_respects_floor() {
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = ledger(&store, QuotaConfig::default());
        ledger.create_owner(owner_id(), 3).await.unwrap();

        let entity = OwnedEntity::new(owner_id(), "svc");
        ledger.create_with_ledger_increment(&entity).await.unwrap();

        // Simulate a ledger already corrected downward elsewhere.
        store
            .atomic_add(&ItemKey::owner(&owner_id()), ATTR_LEDGER_COUNT, -1, None)
            .await
            .unwrap();

        let outcome = ledger
            .soft_delete_with_ledger_decrement(&owner_id(), &entity.id)
            .await
            .unwrap();
        assert!(!outcome.ledger_decremented);
        assert_eq!(ledger.get_owner(&owner_id()).await.unwrap().ledger_count, 0);

        let stored = store.get(&entity.key()).await.unwrap().unwrap();
        assert!(stored.require_bool("deleted").unwrap());

        let err = ledger
            .soft_delete_with_ledger_decrement(&owner_id(), &entity.id)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_bulk_soft_delete_in_batches() {
        let store = Arc::new(InMemoryEntityStore::new());
        let ledger = ledger(&store, QuotaConfig::default().delete_batch_size(2));
        ledger.create_owner(owner_id(), 10).await.unwrap();

        let mut entities = Vec::new();
        for i in 0..5 {
            let entity = OwnedEntity::new(owner_id(), format!("svc-{}", i));
            ledger.create_with_ledger_increment(&entity).await.unwrap();
            entities.push(entity);
        }
        ledger
            .soft_delete_with_ledger_decrement(&owner_id(), &entities[0].id)
            .await
            .unwrap();

        let outcome = ledger.soft_delete_all_for_owner(&owner_id()).await.unwrap();
        assert_eq!(outcome.deleted, 4);
        assert_eq!(outcome.ledger_decremented, 4);
        assert_eq!(outcome.batches, 2);
        assert_eq!(ledger.get_owner(&owner_id()).await.unwrap().ledger_count, 0);
    }
}
