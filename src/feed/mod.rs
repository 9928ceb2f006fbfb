// ============================================================================
// Change Feed Module
// ============================================================================
//
// Asynchronous, at-least-once, per-key ordered stream of item mutations and
// the shard workers that drive the reconciliation processor from it.
//
// ============================================================================

pub mod dead_letter;
pub mod record;
pub mod shard;
pub mod stream;
pub mod worker;

pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterQueue};
pub use record::{ChangeRecord, EventKind};
pub use shard::stable_shard_for;
pub use stream::{ChangeFeed, Delivery, ShardPosition};
pub use worker::{FeedWorkerPool, FeedWorkerStats};
