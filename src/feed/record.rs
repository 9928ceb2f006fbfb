use crate::storage::{Item, ItemKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// The item did not exist before the mutation.
    Created,
    /// The item existed before and after the mutation.
    Updated,
    /// The item was physically removed.
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => write!(f, "CREATED"),
            EventKind::Updated => write!(f, "UPDATED"),
            EventKind::Removed => write!(f, "REMOVED"),
        }
    }
}

/// One committed item mutation as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Store-wide commit sequence; increases with commit order.
    pub sequence: u64,
    pub event_kind: EventKind,
    pub key: ItemKey,
    pub pre_image: Option<Item>,
    pub post_image: Option<Item>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Derives the record for a committed mutation, or `None` when nothing changed.
    pub fn for_mutation(
        sequence: u64,
        key: ItemKey,
        pre_image: Option<Item>,
        post_image: Option<Item>,
    ) -> Option<Self> {
        let event_kind = match (&pre_image, &post_image) {
            (None, Some(_)) => EventKind::Created,
            (Some(before), Some(after)) if before != after => EventKind::Updated,
            (Some(_), None) => EventKind::Removed,
            _ => return None,
        };

        Some(Self {
            sequence,
            event_kind,
            key,
            pre_image,
            post_image,
            committed_at: Utc::now(),
        })
    }
}
