use crate::core::{QuotaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single attribute value stored on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "BOOL",
            AttrValue::Int(_) => "INT",
            AttrValue::Str(_) => "STR",
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Str(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

/// An item image: the full attribute map of one stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item {
    attrs: BTreeMap<String, AttrValue>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.attrs.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.attrs.iter()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Reads a required boolean attribute.
    pub fn require_bool(&self, name: &str) -> Result<bool> {
        match self.attrs.get(name) {
            Some(AttrValue::Bool(b)) => Ok(*b),
            Some(other) => Err(type_error(name, "BOOL", other)),
            None => Err(missing(name)),
        }
    }

    /// Reads a boolean attribute, treating absence as `false`.
    ///
    /// Processing flags are written on create, but images produced by older
    /// writers may not carry them yet.
    pub fn bool_or_false(&self, name: &str) -> Result<bool> {
        match self.attrs.get(name) {
            Some(AttrValue::Bool(b)) => Ok(*b),
            Some(other) => Err(type_error(name, "BOOL", other)),
            None => Ok(false),
        }
    }

    pub fn require_int(&self, name: &str) -> Result<i64> {
        match self.attrs.get(name) {
            Some(AttrValue::Int(i)) => Ok(*i),
            Some(other) => Err(type_error(name, "INT", other)),
            None => Err(missing(name)),
        }
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        match self.attrs.get(name) {
            Some(AttrValue::Str(s)) => Ok(s),
            Some(other) => Err(type_error(name, "STR", other)),
            None => Err(missing(name)),
        }
    }
}

fn missing(name: &str) -> QuotaError {
    QuotaError::Validation(format!("attribute '{}' is missing", name))
}

fn type_error(name: &str, expected: &str, actual: &AttrValue) -> QuotaError {
    QuotaError::Validation(format!(
        "attribute '{}' expected {}, found {}",
        name,
        expected,
        actual.type_name()
    ))
}
