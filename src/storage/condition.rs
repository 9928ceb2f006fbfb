use super::item::{AttrValue, Item};
use super::keys::ItemKey;
use crate::core::{QuotaError, Result};
use std::fmt;

/// A precondition evaluated against the current image of one item at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Exists,
    NotExists,
    Equals { attr: String, value: AttrValue },
    /// Boolean attribute that is absent or `false`.
    Unset { attr: String },
    GreaterThan { attr: String, value: i64 },
    GreaterOrEqual { attr: String, value: i64 },
    LessThan { attr: String, value: i64 },
    /// `attr < other`, both integer attributes of the same item.
    LessThanAttr { attr: String, other: String },
    And(Vec<Condition>),
}

impl Condition {
    pub fn equals(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Condition::Equals {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn unset(attr: impl Into<String>) -> Self {
        Condition::Unset { attr: attr.into() }
    }

    pub fn greater_than(attr: impl Into<String>, value: i64) -> Self {
        Condition::GreaterThan {
            attr: attr.into(),
            value,
        }
    }

    pub fn greater_or_equal(attr: impl Into<String>, value: i64) -> Self {
        Condition::GreaterOrEqual {
            attr: attr.into(),
            value,
        }
    }

    pub fn less_than_attr(attr: impl Into<String>, other: impl Into<String>) -> Self {
        Condition::LessThanAttr {
            attr: attr.into(),
            other: other.into(),
        }
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Condition) -> Self {
        let mut parts = match self {
            Condition::And(parts) => parts,
            single => vec![single],
        };
        match other {
            Condition::And(more) => parts.extend(more),
            single => parts.push(single),
        }
        Condition::And(parts)
    }

    /// Evaluates against the current image; `None` means the item is absent.
    ///
    /// Comparisons against a missing or non-integer attribute are false.
    pub fn evaluate(&self, item: Option<&Item>) -> bool {
        match self {
            Condition::Exists => item.is_some(),
            Condition::NotExists => item.is_none(),
            Condition::Equals { attr, value } => {
                item.and_then(|i| i.get(attr)).is_some_and(|v| v == value)
            }
            Condition::Unset { attr } => match item.and_then(|i| i.get(attr)) {
                None => true,
                Some(v) => v.as_bool() == Some(false),
            },
            Condition::GreaterThan { attr, value } => {
                int_attr(item, attr).is_some_and(|v| v > *value)
            }
            Condition::GreaterOrEqual { attr, value } => {
                int_attr(item, attr).is_some_and(|v| v >= *value)
            }
            Condition::LessThan { attr, value } => int_attr(item, attr).is_some_and(|v| v < *value),
            Condition::LessThanAttr { attr, other } => {
                match (int_attr(item, attr), int_attr(item, other)) {
                    (Some(left), Some(right)) => left < right,
                    _ => false,
                }
            }
            Condition::And(parts) => parts.iter().all(|part| part.evaluate(item)),
        }
    }
}

fn int_attr(item: Option<&Item>, attr: &str) -> Option<i64> {
    item.and_then(|i| i.get(attr)).and_then(AttrValue::as_int)
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Exists => write!(f, "exists"),
            Condition::NotExists => write!(f, "not_exists"),
            Condition::Equals { attr, value } => write!(f, "{} = {}", attr, value),
            Condition::Unset { attr } => write!(f, "{} unset", attr),
            Condition::GreaterThan { attr, value } => write!(f, "{} > {}", attr, value),
            Condition::GreaterOrEqual { attr, value } => write!(f, "{} >= {}", attr, value),
            Condition::LessThan { attr, value } => write!(f, "{} < {}", attr, value),
            Condition::LessThanAttr { attr, other } => write!(f, "{} < {}", attr, other),
            Condition::And(parts) => {
                for (index, part) in parts.iter().enumerate() {
                    if index > 0 {
                        write!(f, " AND ")?;
                    }
                    write!(f, "{}", part)?;
                }
                Ok(())
            }
        }
    }
}

/// A single attribute mutation inside an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAction {
    Set { attr: String, value: AttrValue },
    /// Store-side atomic add. An absent attribute counts as 0.
    Add { attr: String, delta: i64 },
    Remove { attr: String },
}

impl UpdateAction {
    pub fn set(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        UpdateAction::Set {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn add(attr: impl Into<String>, delta: i64) -> Self {
        UpdateAction::Add {
            attr: attr.into(),
            delta,
        }
    }

    pub fn apply(&self, item: &mut Item) -> Result<()> {
        match self {
            UpdateAction::Set { attr, value } => {
                item.set(attr.clone(), value.clone());
            }
            UpdateAction::Add { attr, delta } => {
                let current = match item.get(attr) {
                    None => 0,
                    Some(AttrValue::Int(v)) => *v,
                    Some(other) => {
                        return Err(QuotaError::Validation(format!(
                            "cannot ADD to attribute '{}' of type {}",
                            attr,
                            other.type_name()
                        )));
                    }
                };
                let next = current.checked_add(*delta).ok_or_else(|| {
                    QuotaError::Validation(format!("ADD overflow on attribute '{}'", attr))
                })?;
                item.set(attr.clone(), next);
            }
            UpdateAction::Remove { attr } => {
                item.remove(attr);
            }
        }
        Ok(())
    }
}

/// One write inside a transaction, with its own optional precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionedOp {
    /// Writes the full item, replacing any previous image.
    Put {
        key: ItemKey,
        item: Item,
        condition: Option<Condition>,
    },
    /// Applies actions to the item, creating it when absent.
    Update {
        key: ItemKey,
        actions: Vec<UpdateAction>,
        condition: Option<Condition>,
    },
    Delete {
        key: ItemKey,
        condition: Option<Condition>,
    },
    /// Asserts a condition without writing.
    ConditionCheck { key: ItemKey, condition: Condition },
}

impl ConditionedOp {
    pub fn key(&self) -> &ItemKey {
        match self {
            ConditionedOp::Put { key, .. }
            | ConditionedOp::Update { key, .. }
            | ConditionedOp::Delete { key, .. }
            | ConditionedOp::ConditionCheck { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            ConditionedOp::Put { condition, .. }
            | ConditionedOp::Update { condition, .. }
            | ConditionedOp::Delete { condition, .. } => condition.as_ref(),
            ConditionedOp::ConditionCheck { condition, .. } => Some(condition),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConditionedOp::Put { .. } => "put",
            ConditionedOp::Update { .. } => "update",
            ConditionedOp::Delete { .. } => "delete",
            ConditionedOp::ConditionCheck { .. } => "condition_check",
        }
    }

    /// Computes the image after this op; `None` means the item is gone.
    pub fn apply(&self, current: Option<&Item>) -> Result<Option<Item>> {
        match self {
            ConditionedOp::Put { item, .. } => Ok(Some(item.clone())),
            ConditionedOp::Update { actions, .. } => {
                let mut next = current.cloned().unwrap_or_default();
                for action in actions {
                    action.apply(&mut next)?;
                }
                Ok(Some(next))
            }
            ConditionedOp::Delete { .. } => Ok(None),
            ConditionedOp::ConditionCheck { .. } => Ok(current.cloned()),
        }
    }
}
