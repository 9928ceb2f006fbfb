// ============================================================================
// Counter Module
// ============================================================================
//
// Synchronous write-path side of the quota engine: the transactional ledger
// on the owner record and the admission gate that merges it with the
// reconciliation counter.
//
// ============================================================================

pub mod gate;
pub mod ledger;
pub mod retry;

pub use gate::{AdmissionDecision, QuotaGate, Verdict};
pub use ledger::{BulkDeleteOutcome, CounterLedger, SoftDeleteOutcome};
pub use retry::with_retry;
