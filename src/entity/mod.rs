pub mod lifecycle;
pub mod records;

pub use lifecycle::{LifecycleEvent, LifecycleFlags, LifecycleState, removal_guard};
pub use records::{OwnedEntity, Owner, ReconciliationCounter};
