use super::condition::{Condition, ConditionedOp};
use super::item::Item;
use super::keys::ItemKey;
use crate::core::Result;
use async_trait::async_trait;

/// Storage engine trait - the only strongly consistent primitives the counters rely on.
///
/// Every write is atomic and isolated at its own boundary. A failed condition is
/// reported as `QuotaError::PreconditionFailed` carrying the index of the
/// offending operation; contention is `TransactionConflict`; anything the store
/// could not finish is `Transient`. A failed call leaves no partial state.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Applies all operations or none of them.
    async fn transact_write(&self, ops: Vec<ConditionedOp>) -> Result<()>;

    /// Applies a single conditioned operation.
    async fn conditional_write(&self, op: ConditionedOp) -> Result<()>;

    /// Adds `delta` to an integer attribute and returns the new value.
    async fn atomic_add(
        &self,
        key: &ItemKey,
        attr: &str,
        delta: i64,
        precondition: Option<Condition>,
    ) -> Result<i64>;

    /// Point read of the latest committed image.
    async fn get(&self, key: &ItemKey) -> Result<Option<Item>>;

    /// Items in `partition` whose sort key starts with `sort_prefix`, in sort-key order.
    async fn query_partition(&self, partition: &str, sort_prefix: &str)
    -> Result<Vec<(ItemKey, Item)>>;
}
