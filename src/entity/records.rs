use super::lifecycle::{LifecycleFlags, LifecycleState};
use crate::core::{CounterType, EntityId, OwnerId, Result};
use crate::storage::{Item, ItemKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ATTR_OWNER_ID: &str = "owner_id";
pub const ATTR_ENTITY_ID: &str = "entity_id";
pub const ATTR_NAME: &str = "name";
pub const ATTR_LEDGER_COUNT: &str = "ledger_count";
pub const ATTR_QUOTA_MAX: &str = "quota_max";
pub const ATTR_COUNTER_TYPE: &str = "counter_type";
pub const ATTR_COUNT_VALUE: &str = "count_value";
pub const ATTR_CREATED_AT: &str = "created_at";

fn read_timestamp(item: &Item) -> Option<DateTime<Utc>> {
    item.get(ATTR_CREATED_AT)
        .and_then(|v| v.as_str())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// The quota-holding parent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: OwnerId,
    pub ledger_count: i64,
    pub quota_max: i64,
    pub created_at: Option<DateTime<Utc>>,
}

impl Owner {
    pub fn new(id: OwnerId, quota_max: i64) -> Self {
        Self {
            id,
            ledger_count: 0,
            quota_max,
            created_at: Some(Utc::now()),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::owner(&self.id)
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new()
            .with(ATTR_OWNER_ID, self.id.as_str())
            .with(ATTR_LEDGER_COUNT, self.ledger_count)
            .with(ATTR_QUOTA_MAX, self.quota_max);
        if let Some(created_at) = self.created_at {
            item.set(ATTR_CREATED_AT, created_at.to_rfc3339());
        }
        item
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        Ok(Self {
            id: OwnerId::new(item.require_str(ATTR_OWNER_ID)?)?,
            ledger_count: item.require_int(ATTR_LEDGER_COUNT)?,
            quota_max: item.require_int(ATTR_QUOTA_MAX)?,
            created_at: read_timestamp(item),
        })
    }
}

/// A child resource counted against its owner's quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedEntity {
    pub id: EntityId,
    pub owner_id: OwnerId,
    pub name: String,
    pub deleted: bool,
    pub create_processed: bool,
    pub delete_processed: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl OwnedEntity {
    /// A fresh entity in the `Created` state.
    pub fn new(owner_id: OwnerId, name: impl Into<String>) -> Self {
        Self::with_id(EntityId::generate(), owner_id, name)
    }

    pub fn with_id(id: EntityId, owner_id: OwnerId, name: impl Into<String>) -> Self {
        Self {
            id,
            owner_id,
            name: name.into(),
            deleted: false,
            create_processed: false,
            delete_processed: false,
            created_at: Some(Utc::now()),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::entity(&self.owner_id, &self.id)
    }

    pub fn flags(&self) -> LifecycleFlags {
        LifecycleFlags {
            deleted: self.deleted,
            create_processed: self.create_processed,
            delete_processed: self.delete_processed,
        }
    }

    pub fn lifecycle(&self) -> Result<LifecycleState> {
        LifecycleState::from_flags(self.flags())
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new()
            .with(ATTR_ENTITY_ID, self.id.as_str())
            .with(ATTR_OWNER_ID, self.owner_id.as_str())
            .with(ATTR_NAME, self.name.as_str());
        self.flags().write_to(&mut item);
        if let Some(created_at) = self.created_at {
            item.set(ATTR_CREATED_AT, created_at.to_rfc3339());
        }
        item
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        let flags = LifecycleFlags::from_item(item)?;
        Ok(Self {
            id: EntityId::new(item.require_str(ATTR_ENTITY_ID)?)?,
            owner_id: OwnerId::new(item.require_str(ATTR_OWNER_ID)?)?,
            name: item
                .get(ATTR_NAME)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            deleted: flags.deleted,
            create_processed: flags.create_processed,
            delete_processed: flags.delete_processed,
            created_at: read_timestamp(item),
        })
    }
}

/// Eventually consistent tally maintained from the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationCounter {
    pub owner_id: OwnerId,
    pub counter_type: CounterType,
    pub count_value: i64,
}

impl ReconciliationCounter {
    pub fn new(owner_id: OwnerId, counter_type: CounterType) -> Self {
        Self {
            owner_id,
            counter_type,
            count_value: 0,
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::counter(&self.owner_id, &self.counter_type)
    }

    pub fn to_item(&self) -> Item {
        Item::new()
            .with(ATTR_OWNER_ID, self.owner_id.as_str())
            .with(ATTR_COUNTER_TYPE, self.counter_type.as_str())
            .with(ATTR_COUNT_VALUE, self.count_value)
    }

    /// Decodes a counter item.
    ///
    /// Counters created lazily by an atomic add carry only `count_value`, so
    /// the identity comes from the key.
    pub fn from_item(owner_id: OwnerId, counter_type: CounterType, item: &Item) -> Result<Self> {
        Ok(Self {
            owner_id,
            counter_type,
            count_value: item.require_int(ATTR_COUNT_VALUE)?,
        })
    }
}
