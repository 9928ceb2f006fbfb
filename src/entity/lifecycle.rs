// ============================================================================
// Owned-Entity Lifecycle
// ============================================================================
//
// The three processing flags of an owned entity form a small monotonic state
// machine. Every reconciliation write is guarded by the flags of the state it
// leaves, which is what makes a redelivered record a no-op.
//
//   Created ──reconcile_create──> CreateReconciled
//      │                                │
//   soft_delete                    soft_delete
//      │                                │
//      v                                v
//   DeletedUnreconciled ──reconcile_create──> DeleteRequested
//                                               │
//                                        reconcile_delete
//                                               │
//                                               v
//                                        DeleteReconciled ──> hard-removed
//
// No transition ever clears a flag.
// ============================================================================

use crate::core::{QuotaError, Result};
use crate::storage::{Condition, Item, UpdateAction};
use std::fmt;

pub const ATTR_DELETED: &str = "deleted";
pub const ATTR_CREATE_PROCESSED: &str = "create_processed";
pub const ATTR_DELETE_PROCESSED: &str = "delete_processed";

/// Raw flag triple as stored on the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecycleFlags {
    pub deleted: bool,
    pub create_processed: bool,
    pub delete_processed: bool,
}

impl LifecycleFlags {
    /// Reads the flags from an item image; absent flags read as `false`.
    pub fn from_item(item: &Item) -> Result<Self> {
        Ok(Self {
            deleted: item.bool_or_false(ATTR_DELETED)?,
            create_processed: item.bool_or_false(ATTR_CREATE_PROCESSED)?,
            delete_processed: item.bool_or_false(ATTR_DELETE_PROCESSED)?,
        })
    }

    pub fn write_to(&self, item: &mut Item) {
        item.set(ATTR_DELETED, self.deleted);
        item.set(ATTR_CREATE_PROCESSED, self.create_processed);
        item.set(ATTR_DELETE_PROCESSED, self.delete_processed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Written by the ledger; not yet counted by reconciliation.
    Created,
    /// Counted by reconciliation.
    CreateReconciled,
    /// Soft-deleted before reconciliation counted it.
    DeletedUnreconciled,
    /// Counted, then soft-deleted; waiting for the reconciliation decrement.
    DeleteRequested,
    /// Decrement applied; the item only waits for physical removal.
    DeleteReconciled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    SoftDelete,
    ReconcileCreate,
    ReconcileDelete,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::SoftDelete => write!(f, "soft_delete"),
            LifecycleEvent::ReconcileCreate => write!(f, "reconcile_create"),
            LifecycleEvent::ReconcileDelete => write!(f, "reconcile_delete"),
        }
    }
}

impl LifecycleState {
    /// Decodes a flag triple, rejecting combinations no transition can reach.
    pub fn from_flags(flags: LifecycleFlags) -> Result<Self> {
        let LifecycleFlags {
            deleted,
            create_processed,
            delete_processed,
        } = flags;
        match (deleted, create_processed, delete_processed) {
            (false, false, false) => Ok(LifecycleState::Created),
            (false, true, false) => Ok(LifecycleState::CreateReconciled),
            (true, false, false) => Ok(LifecycleState::DeletedUnreconciled),
            (true, true, false) => Ok(LifecycleState::DeleteRequested),
            (true, true, true) => Ok(LifecycleState::DeleteReconciled),
            _ => Err(QuotaError::InvalidTransition(format!(
                "unreachable flag combination deleted={} create_processed={} delete_processed={}",
                deleted, create_processed, delete_processed
            ))),
        }
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        Self::from_flags(LifecycleFlags::from_item(item)?)
    }

    pub fn flags(&self) -> LifecycleFlags {
        let (deleted, create_processed, delete_processed) = match self {
            LifecycleState::Created => (false, false, false),
            LifecycleState::CreateReconciled => (false, true, false),
            LifecycleState::DeletedUnreconciled => (true, false, false),
            LifecycleState::DeleteRequested => (true, true, false),
            LifecycleState::DeleteReconciled => (true, true, true),
        };
        LifecycleFlags {
            deleted,
            create_processed,
            delete_processed,
        }
    }

    pub fn apply(self, event: LifecycleEvent) -> Result<Self> {
        use LifecycleEvent::*;
        use LifecycleState::*;

        match (self, event) {
            (Created, ReconcileCreate) => Ok(CreateReconciled),
            (Created, SoftDelete) => Ok(DeletedUnreconciled),
            (CreateReconciled, SoftDelete) => Ok(DeleteRequested),
            (DeletedUnreconciled, ReconcileCreate) => Ok(DeleteRequested),
            (DeleteRequested, ReconcileDelete) => Ok(DeleteReconciled),
            (state, event) => Err(QuotaError::InvalidTransition(format!(
                "{} is not allowed from {}",
                event, state
            ))),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags().deleted
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::DeleteReconciled)
    }

    pub fn accepts(&self, event: LifecycleEvent) -> bool {
        self.apply(event).is_ok()
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "CREATED"),
            LifecycleState::CreateReconciled => write!(f, "CREATE_RECONCILED"),
            LifecycleState::DeletedUnreconciled => write!(f, "DELETED_UNRECONCILED"),
            LifecycleState::DeleteRequested => write!(f, "DELETE_REQUESTED"),
            LifecycleState::DeleteReconciled => write!(f, "DELETE_RECONCILED"),
        }
    }
}

impl LifecycleEvent {
    /// The single flag this event flips to `true`.
    pub fn flag(&self) -> &'static str {
        match self {
            LifecycleEvent::SoftDelete => ATTR_DELETED,
            LifecycleEvent::ReconcileCreate => ATTR_CREATE_PROCESSED,
            LifecycleEvent::ReconcileDelete => ATTR_DELETE_PROCESSED,
        }
    }

    pub fn flag_update(&self) -> UpdateAction {
        UpdateAction::set(self.flag(), true)
    }

    /// Store condition that holds exactly when the stored item is in a state
    /// that accepts this event. Absent flags count as `false`, matching
    /// `LifecycleFlags::from_item`.
    pub fn guard(&self) -> Condition {
        let base = Condition::Exists;
        match self {
            LifecycleEvent::SoftDelete => base.and(Condition::unset(ATTR_DELETED)),
            LifecycleEvent::ReconcileCreate => base.and(Condition::unset(ATTR_CREATE_PROCESSED)),
            LifecycleEvent::ReconcileDelete => base
                .and(Condition::equals(ATTR_DELETED, true))
                .and(Condition::equals(ATTR_CREATE_PROCESSED, true))
                .and(Condition::unset(ATTR_DELETE_PROCESSED)),
        }
    }
}

/// Condition under which the physical removal of an entity is allowed.
pub fn removal_guard() -> Condition {
    Condition::equals(ATTR_DELETE_PROCESSED, true)
}
