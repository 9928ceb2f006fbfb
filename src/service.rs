// ============================================================================
// Owned-Entity Service
// ============================================================================
//
// Write-path facade used by request handlers:
//
//   create_entity: QuotaGate::admit ──deny──> QuotaExceeded
//                        │
//                      allow
//                        v
//                  CounterLedger::create_with_ledger_increment
//
// Reads hide soft-deleted entities; they only exist until reconciliation
// removes them.
// ============================================================================

use crate::config::QuotaConfig;
use crate::core::{EntityId, OwnerId, QuotaError, Result};
use crate::counter::{
    AdmissionDecision, BulkDeleteOutcome, CounterLedger, QuotaGate, SoftDeleteOutcome,
};
use crate::entity::{OwnedEntity, Owner, ReconciliationCounter};
use crate::storage::keys::{COUNTER_PREFIX, ENTITY_PREFIX, owner_partition};
use crate::storage::{EntityStore, ItemKey, KeyKind};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

pub struct OwnedEntityService {
    store: Arc<dyn EntityStore>,
    ledger: CounterLedger,
    gate: QuotaGate,
    config: QuotaConfig,
}

impl OwnedEntityService {
    pub fn new(store: Arc<dyn EntityStore>, config: QuotaConfig) -> Result<Self> {
        let ledger = CounterLedger::new(store.clone(), &config)?;
        let gate = QuotaGate::new(store.clone(), config.counter_kind()?);
        Ok(Self {
            store,
            ledger,
            gate,
            config,
        })
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn ledger(&self) -> &CounterLedger {
        &self.ledger
    }

    pub fn gate(&self) -> &QuotaGate {
        &self.gate
    }

    /// Creates an owner; `quota_max` falls back to the configured default.
    pub async fn create_owner(&self, owner_id: OwnerId, quota_max: Option<i64>) -> Result<Owner> {
        let quota_max = quota_max.unwrap_or(self.config.default_quota_max);
        self.ledger.create_owner(owner_id, quota_max).await
    }

    pub async fn get_owner(&self, owner_id: &OwnerId) -> Result<Owner> {
        self.ledger.get_owner(owner_id).await
    }

    pub async fn admission(&self, owner_id: &OwnerId) -> Result<AdmissionDecision> {
        self.gate.admit(owner_id).await
    }

    /// Admits and creates a new entity for `owner_id`.
    pub async fn create_entity(
        &self,
        owner_id: &OwnerId,
        name: impl Into<String>,
    ) -> Result<OwnedEntity> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QuotaError::Validation("entity name must not be empty".into()));
        }

        let entity = OwnedEntity::new(owner_id.clone(), name);
        let span = info_span!(
            "service.create_entity",
            owner_id = %owner_id,
            entity_id = %entity.id
        );
        async move {
            let decision = self.gate.admit(owner_id).await?.into_result()?;
            event!(
                Level::DEBUG,
                effective = decision.effective,
                quota_max = decision.quota_max,
                "admitted"
            );
            self.ledger.create_with_ledger_increment(&entity).await?;
            Ok(entity)
        }
        .instrument(span)
        .await
    }

    /// Reads a live entity; soft-deleted entities are `NotFound`.
    pub async fn get_entity(&self, owner_id: &OwnerId, entity_id: &EntityId) -> Result<OwnedEntity> {
        let item = self
            .store
            .get(&ItemKey::entity(owner_id, entity_id))
            .await?
            .ok_or_else(|| QuotaError::not_found("OwnedEntity", entity_id))?;
        let entity = OwnedEntity::from_item(&item)?;
        if entity.deleted {
            return Err(QuotaError::not_found("OwnedEntity", entity_id));
        }
        Ok(entity)
    }

    /// Live entities of an owner, in key order.
    pub async fn list_entities(&self, owner_id: &OwnerId) -> Result<Vec<OwnedEntity>> {
        self.ledger.get_owner(owner_id).await?;
        let mut entities = Vec::new();
        for (_, item) in self
            .store
            .query_partition(&owner_partition(owner_id), ENTITY_PREFIX)
            .await?
        {
            let entity = OwnedEntity::from_item(&item)?;
            if !entity.deleted {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    pub async fn delete_entity(
        &self,
        owner_id: &OwnerId,
        entity_id: &EntityId,
    ) -> Result<SoftDeleteOutcome> {
        self.ledger
            .soft_delete_with_ledger_decrement(owner_id, entity_id)
            .await
    }

    pub async fn delete_all_entities(&self, owner_id: &OwnerId) -> Result<BulkDeleteOutcome> {
        self.ledger.soft_delete_all_for_owner(owner_id).await
    }

    /// Every reconciliation counter stored under the owner.
    pub async fn list_counters(&self, owner_id: &OwnerId) -> Result<Vec<ReconciliationCounter>> {
        self.ledger.get_owner(owner_id).await?;
        let mut counters = Vec::new();
        for (key, item) in self
            .store
            .query_partition(&owner_partition(owner_id), COUNTER_PREFIX)
            .await?
        {
            if let KeyKind::Counter {
                owner_id,
                counter_type,
            } = key.kind()?
            {
                counters.push(ReconciliationCounter::from_item(owner_id, counter_type, &item)?);
            }
        }
        Ok(counters)
    }
}
