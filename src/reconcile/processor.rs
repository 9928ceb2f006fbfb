// ============================================================================
// Reconciliation Processor
// ============================================================================
//
// Change-feed consumer that maintains the reconciliation counter. Each record
// is classified, then at most one observation runs:
//
//   creation:  [entity: create_processed=true | guard ReconcileCreate]
//              [counter: count_value += 1]                    one transaction
//
//   deletion:  [entity: delete_processed=true | guard ReconcileDelete]
//              [counter: count_value -= 1]                    one transaction
//              then remove the entity       | guard delete_processed=true
//
// A failed lifecycle guard means the observation was already applied, so it
// is reported as a duplicate and the counter is left alone. Every other store
// failure is handed back to the feed runtime as retryable.
// ============================================================================

use crate::core::{CounterType, EntityId, OwnerId, ProcessError, QuotaError};
use crate::entity::records::{ATTR_COUNT_VALUE, ATTR_COUNTER_TYPE, ATTR_OWNER_ID};
use crate::entity::{LifecycleEvent, LifecycleFlags, removal_guard};
use crate::feed::{ChangeRecord, EventKind};
use crate::storage::{ConditionedOp, EntityStore, ItemKey, KeyKind, UpdateAction};
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Which counter adjustment a record called for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Observation {
    Create,
    Delete,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::Create => write!(f, "create"),
            Observation::Delete => write!(f, "delete"),
        }
    }
}

/// Successful result of processing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The counter was adjusted.
    Applied(Observation),
    /// The observation had already been applied; nothing changed.
    Duplicate(Observation),
    /// An entity record that needs no counter work (yet).
    Skipped,
    /// Not an entity mutation, or a physical removal.
    Ignored,
}

impl RecordOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RecordOutcome::Applied(_) => "applied",
            RecordOutcome::Duplicate(_) => "duplicate",
            RecordOutcome::Skipped => "skipped",
            RecordOutcome::Ignored => "ignored",
        }
    }
}

type ProcessResult = std::result::Result<RecordOutcome, ProcessError>;

pub struct ReconciliationProcessor {
    store: Arc<dyn EntityStore>,
    counter_type: CounterType,
}

impl ReconciliationProcessor {
    pub fn new(store: Arc<dyn EntityStore>, counter_type: CounterType) -> Self {
        Self {
            store,
            counter_type,
        }
    }

    pub fn counter_type(&self) -> &CounterType {
        &self.counter_type
    }

    /// Applies one change record.
    ///
    /// Safe to call any number of times with the same record: only the first
    /// successful call changes the counter.
    pub async fn process_record(&self, record: &ChangeRecord) -> ProcessResult {
        let span = info_span!(
            "reconcile.record",
            sequence = record.sequence,
            key = %record.key,
            event_kind = %record.event_kind
        );

        async move {
            let result = self.dispatch(record).await;
            match &result {
                Ok(outcome) => {
                    event!(Level::DEBUG, outcome = outcome.label(), "record processed")
                }
                Err(ProcessError::Retryable(err)) => {
                    event!(Level::WARN, error = %err, "record processing failed, will be redelivered")
                }
                Err(ProcessError::Permanent(err)) => {
                    event!(Level::ERROR, error = %err, "record cannot be processed")
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, record: &ChangeRecord) -> ProcessResult {
        if record.event_kind == EventKind::Removed {
            return Ok(RecordOutcome::Ignored);
        }

        let (owner_id, entity_id) = match record.key.kind().map_err(ProcessError::Permanent)? {
            KeyKind::Entity {
                owner_id,
                entity_id,
            } => (owner_id, entity_id),
            KeyKind::Owner { .. } | KeyKind::Counter { .. } | KeyKind::Other => {
                return Ok(RecordOutcome::Ignored);
            }
        };

        let post_image = record.post_image.as_ref().ok_or_else(|| {
            ProcessError::Permanent(QuotaError::MalformedRecord(format!(
                "{} record for {} has no post-image",
                record.event_kind, record.key
            )))
        })?;
        let flags = LifecycleFlags::from_item(post_image).map_err(|err| {
            ProcessError::Permanent(QuotaError::MalformedRecord(format!(
                "record for {}: {}",
                record.key, err
            )))
        })?;

        match record.event_kind {
            EventKind::Created => self.observe_create(&owner_id, &record.key).await,
            EventKind::Updated if flags.deleted => {
                if flags.create_processed && !flags.delete_processed {
                    self.observe_delete(&owner_id, &entity_id, &record.key).await
                } else {
                    // Either not counted yet (the creation record precedes this
                    // one on the shard) or the decrement already happened.
                    Ok(RecordOutcome::Skipped)
                }
            }
            EventKind::Updated if !flags.create_processed => {
                self.observe_create(&owner_id, &record.key).await
            }
            EventKind::Updated | EventKind::Removed => Ok(RecordOutcome::Skipped),
        }
    }

    fn counter_key(&self, owner_id: &OwnerId) -> ItemKey {
        ItemKey::counter(owner_id, &self.counter_type)
    }

    fn counter_update(&self, owner_id: &OwnerId, delta: i64) -> ConditionedOp {
        ConditionedOp::Update {
            key: self.counter_key(owner_id),
            actions: vec![
                UpdateAction::set(ATTR_OWNER_ID, owner_id.as_str()),
                UpdateAction::set(ATTR_COUNTER_TYPE, self.counter_type.as_str()),
                UpdateAction::add(ATTR_COUNT_VALUE, delta),
            ],
            condition: None,
        }
    }

    async fn observe_create(&self, owner_id: &OwnerId, entity_key: &ItemKey) -> ProcessResult {
        let event = LifecycleEvent::ReconcileCreate;
        let ops = vec![
            ConditionedOp::Update {
                key: entity_key.clone(),
                actions: vec![event.flag_update()],
                condition: Some(event.guard()),
            },
            self.counter_update(owner_id, 1),
        ];

        match self.store.transact_write(ops).await {
            Ok(()) => {
                event!(Level::INFO, owner_id = %owner_id, "reconciliation counter incremented");
                Ok(RecordOutcome::Applied(Observation::Create))
            }
            Err(err) if err.failed_operation() == Some(0) => {
                event!(Level::DEBUG, "creation already reconciled");
                Ok(RecordOutcome::Duplicate(Observation::Create))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn observe_delete(
        &self,
        owner_id: &OwnerId,
        entity_id: &EntityId,
        entity_key: &ItemKey,
    ) -> ProcessResult {
        let event = LifecycleEvent::ReconcileDelete;
        let ops = vec![
            ConditionedOp::Update {
                key: entity_key.clone(),
                actions: vec![event.flag_update()],
                condition: Some(event.guard()),
            },
            self.counter_update(owner_id, -1),
        ];

        let outcome = match self.store.transact_write(ops).await {
            Ok(()) => {
                event!(Level::INFO, owner_id = %owner_id, "reconciliation counter decremented");
                RecordOutcome::Applied(Observation::Delete)
            }
            Err(err) if err.failed_operation() == Some(0) => {
                event!(Level::DEBUG, "deletion already reconciled");
                RecordOutcome::Duplicate(Observation::Delete)
            }
            Err(err) => return Err(err.into()),
        };

        self.remove_entity(entity_id, entity_key).await?;
        Ok(outcome)
    }

    /// Physically removes a delete-reconciled entity. An absent item counts as
    /// removed.
    async fn remove_entity(
        &self,
        entity_id: &EntityId,
        entity_key: &ItemKey,
    ) -> std::result::Result<(), ProcessError> {
        let op = ConditionedOp::Delete {
            key: entity_key.clone(),
            condition: Some(removal_guard()),
        };
        match self.store.conditional_write(op).await {
            Ok(()) => {
                event!(Level::DEBUG, entity_id = %entity_id, "entity removed");
                Ok(())
            }
            Err(err) if err.is_precondition_failed() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
