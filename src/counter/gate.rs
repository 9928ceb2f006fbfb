use crate::core::{CounterType, OwnerId, QuotaError, Result};
use crate::entity::{Owner, ReconciliationCounter};
use crate::storage::{EntityStore, ItemKey};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "allow"),
            Verdict::Deny => write!(f, "deny"),
        }
    }
}

/// Both counter readings behind an admission verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub owner_id: OwnerId,
    pub verdict: Verdict,
    pub ledger_count: i64,
    pub reconciled_count: i64,
    pub effective: i64,
    pub quota_max: i64,
}

impl AdmissionDecision {
    /// Merges the two counters. The larger one wins so that neither a lagging
    /// reconciliation counter nor a ledger that skipped a decrement can hide
    /// entities from the quota.
    pub fn evaluate(owner_id: OwnerId, ledger_count: i64, reconciled_count: i64, quota_max: i64) -> Self {
        let effective = ledger_count.max(reconciled_count);
        let verdict = if effective >= quota_max {
            Verdict::Deny
        } else {
            Verdict::Allow
        };
        Self {
            owner_id,
            verdict,
            ledger_count,
            reconciled_count,
            effective,
            quota_max,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }

    /// Turns a denial into `QuotaError::QuotaExceeded`.
    pub fn into_result(self) -> Result<Self> {
        match self.verdict {
            Verdict::Allow => Ok(self),
            Verdict::Deny => Err(QuotaError::QuotaExceeded {
                owner_id: self.owner_id.to_string(),
                effective: self.effective,
                quota_max: self.quota_max,
            }),
        }
    }
}

/// Best-effort admission check on the create path.
///
/// The two reads are not serialized against concurrent creates for the same
/// owner; callers in flight together may all be admitted.
pub struct QuotaGate {
    store: Arc<dyn EntityStore>,
    counter_type: CounterType,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn EntityStore>, counter_type: CounterType) -> Self {
        Self {
            store,
            counter_type,
        }
    }

    pub async fn admit(&self, owner_id: &OwnerId) -> Result<AdmissionDecision> {
        let owner = match self.store.get(&ItemKey::owner(owner_id)).await? {
            Some(item) => Owner::from_item(&item)?,
            None => return Err(QuotaError::not_found("Owner", owner_id)),
        };

        // The counter is created lazily by reconciliation; absent means nothing
        // reconciled yet.
        let reconciled_count = match self
            .store
            .get(&ItemKey::counter(owner_id, &self.counter_type))
            .await?
        {
            Some(item) => {
                ReconciliationCounter::from_item(owner_id.clone(), self.counter_type.clone(), &item)?
                    .count_value
            }
            None => 0,
        };

        let decision = AdmissionDecision::evaluate(
            owner.id,
            owner.ledger_count,
            reconciled_count,
            owner.quota_max,
        );
        event!(
            Level::DEBUG,
            owner_id = %decision.owner_id,
            verdict = %decision.verdict,
            ledger_count = decision.ledger_count,
            reconciled_count = decision.reconciled_count,
            quota_max = decision.quota_max,
            "quota admission"
        );
        Ok(decision)
    }
}
