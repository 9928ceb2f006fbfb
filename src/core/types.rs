use super::error::{QuotaError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Counter type used for owned-entity reconciliation counters.
pub const DEFAULT_COUNTER_TYPE: &str = "owned-entities";

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            ///
            /// Identifiers are embedded in store keys, so they must be non-empty
            /// and must not contain the key separators `#` or `|`.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(QuotaError::Validation(format!("{} must not be empty", $label)));
                }
                if value.contains('#') || value.contains('|') {
                    return Err(QuotaError::Validation(format!(
                        "{} '{}' must not contain '#' or '|'",
                        $label, value
                    )));
                }
                Ok(Self(value))
            }

            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a quota-holding owner.
    OwnerId,
    "owner id"
);

opaque_id!(
    /// Identifier of an owned entity, unique within its owner.
    EntityId,
    "entity id"
);

/// Discriminator for reconciliation counters kept under the same owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterType(String);

impl CounterType {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(QuotaError::Validation("counter type must not be empty".into()));
        }
        if value.contains('|') {
            return Err(QuotaError::Validation(format!(
                "counter type '{}' must not contain '|'",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CounterType {
    fn default() -> Self {
        Self(DEFAULT_COUNTER_TYPE.to_string())
    }
}

impl fmt::Display for CounterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
