pub mod error;
pub mod types;

pub use error::{ErrorClass, ProcessError, QuotaError, Result};
pub use types::{CounterType, DEFAULT_COUNTER_TYPE, EntityId, OwnerId};
