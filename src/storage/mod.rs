pub mod condition;
pub mod engine;
pub mod item;
pub mod keys;
pub mod memory;

pub use condition::{Condition, ConditionedOp, UpdateAction};
pub use engine::EntityStore;
pub use item::{AttrValue, Item};
pub use keys::{ItemKey, KeyKind};
pub use memory::{FaultPoint, InMemoryEntityStore, StoreFault, StoreStats};
