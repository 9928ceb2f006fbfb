// ============================================================================
// Single-table key layout
// ============================================================================
//
//   Owner                 OWNER#<owner_id> | METADATA
//   OwnedEntity           OWNER#<owner_id> | ENTITY#<entity_id>
//   ReconciliationCounter OWNER#<owner_id> | COUNT#<counter_type>
//
// Every record of an owner shares the partition, so a partition query lists
// the owner, its entities and its counters in sort-key order.
// ============================================================================

use crate::core::{CounterType, EntityId, OwnerId, QuotaError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const OWNER_PREFIX: &str = "OWNER#";
pub const ENTITY_PREFIX: &str = "ENTITY#";
pub const COUNTER_PREFIX: &str = "COUNT#";
pub const OWNER_METADATA_SORT: &str = "METADATA";

/// Composite primary key of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }

    pub fn owner(owner_id: &OwnerId) -> Self {
        Self::new(owner_partition(owner_id), OWNER_METADATA_SORT)
    }

    pub fn entity(owner_id: &OwnerId, entity_id: &EntityId) -> Self {
        Self::new(
            owner_partition(owner_id),
            format!("{}{}", ENTITY_PREFIX, entity_id),
        )
    }

    pub fn counter(owner_id: &OwnerId, counter_type: &CounterType) -> Self {
        Self::new(
            owner_partition(owner_id),
            format!("{}{}", COUNTER_PREFIX, counter_type),
        )
    }

    /// Classifies the key by its sort-key prefix.
    ///
    /// Keys of the owned-entity collection must decode completely; anything
    /// that looks like an entity key but does not is an error. Keys of
    /// collections this crate does not know about decode to `KeyKind::Other`.
    pub fn kind(&self) -> Result<KeyKind> {
        if let Some(raw_entity) = self.sort.strip_prefix(ENTITY_PREFIX) {
            let owner_id = self.decode_owner()?;
            let entity_id = EntityId::new(raw_entity).map_err(|err| {
                QuotaError::MalformedRecord(format!("entity key '{}': {}", self, err))
            })?;
            return Ok(KeyKind::Entity {
                owner_id,
                entity_id,
            });
        }

        if let Some(raw_counter) = self.sort.strip_prefix(COUNTER_PREFIX) {
            let owner_id = self.decode_owner()?;
            let counter_type = CounterType::new(raw_counter).map_err(|err| {
                QuotaError::MalformedRecord(format!("counter key '{}': {}", self, err))
            })?;
            return Ok(KeyKind::Counter {
                owner_id,
                counter_type,
            });
        }

        if self.sort == OWNER_METADATA_SORT {
            if let Ok(owner_id) = self.decode_owner() {
                return Ok(KeyKind::Owner { owner_id });
            }
        }

        Ok(KeyKind::Other)
    }

    fn decode_owner(&self) -> Result<OwnerId> {
        let raw = self.partition.strip_prefix(OWNER_PREFIX).ok_or_else(|| {
            QuotaError::MalformedRecord(format!(
                "partition '{}' does not start with '{}'",
                self.partition, OWNER_PREFIX
            ))
        })?;
        OwnerId::new(raw)
            .map_err(|err| QuotaError::MalformedRecord(format!("owner key '{}': {}", self, err)))
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.partition, self.sort)
    }
}

pub fn owner_partition(owner_id: &OwnerId) -> String {
    format!("{}{}", OWNER_PREFIX, owner_id)
}

/// Decoded meaning of an `ItemKey`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Owner {
        owner_id: OwnerId,
    },
    Entity {
        owner_id: OwnerId,
        entity_id: EntityId,
    },
    Counter {
        owner_id: OwnerId,
        counter_type: CounterType,
    },
    Other,
}
