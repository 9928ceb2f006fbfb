pub mod processor;

pub use processor::{Observation, ReconciliationProcessor, RecordOutcome};
