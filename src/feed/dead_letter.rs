use super::record::ChangeRecord;
use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A record the consumer gave up on, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub shard: u32,
    pub offset: u64,
    pub record: ChangeRecord,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Destination for records that can never be processed.
///
/// The worker only acknowledges a permanently failing record after the sink
/// accepted it; a sink failure keeps the record on the feed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<()>;
}

/// Keeps dead letters in memory for inspection.
#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }

    /// Removes and returns every stored letter, e.g. for manual replay.
    pub async fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.lock().await)
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn send(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().await.push(letter);
        Ok(())
    }
}
