use std::fmt;
use std::time::Duration;

use dimse::Priority;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Dispatch priority. Lower ordinal is dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPriority {
    Stat,
    High,
    Normal,
    Low,
    Background,
}

impl TransferPriority {
    pub const ALL: [TransferPriority; 5] = [
        TransferPriority::Stat,
        TransferPriority::High,
        TransferPriority::Normal,
        TransferPriority::Low,
        TransferPriority::Background,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// One level up; `Stat` stays `Stat`
    pub fn promoted(self) -> Self {
        match self {
            TransferPriority::Stat | TransferPriority::High => TransferPriority::Stat,
            TransferPriority::Normal => TransferPriority::High,
            TransferPriority::Low => TransferPriority::Normal,
            TransferPriority::Background => TransferPriority::Low,
        }
    }

    /// DIMSE priority field sent with the request
    pub fn dimse_priority(self) -> Priority {
        match self {
            TransferPriority::Stat | TransferPriority::High => Priority::High,
            TransferPriority::Normal => Priority::Medium,
            TransferPriority::Low | TransferPriority::Background => Priority::Low,
        }
    }
}

impl fmt::Display for TransferPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferPriority::Stat => "stat",
            TransferPriority::High => "high",
            TransferPriority::Normal => "normal",
            TransferPriority::Low => "low",
            TransferPriority::Background => "background",
        };
        f.write_str(name)
    }
}

/// A queued transfer. Only the queue changes its priority, and it does so by
/// building a new item for the higher bucket.
#[derive(Debug, Clone)]
pub struct PrioritizedTransferItem<T> {
    pub id: Uuid,
    pub payload: T,
    pub priority: TransferPriority,
    pub queued_at: Instant,
    pub deadline: Option<Instant>,
    pub tag: Option<String>,
    pub droppable: bool,
    /// When the item entered its current bucket
    pub(crate) bucket_entered_at: Instant,
}

impl<T> PrioritizedTransferItem<T> {
    pub fn new(payload: T, priority: TransferPriority) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            queued_at: now,
            deadline: None,
            tag: None,
            droppable: false,
            bucket_entered_at: now,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_ttl(self, ttl: Duration) -> Self {
        self.with_deadline(Instant::now() + ttl)
    }

    pub fn droppable(mut self, droppable: bool) -> Self {
        self.droppable = droppable;
        self
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Time spent queued so far
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.queued_at)
    }

    pub(crate) fn stamp(mut self, now: Instant) -> Self {
        self.queued_at = now;
        self.bucket_entered_at = now;
        self
    }

    /// The same transfer one priority level up, keeping `queued_at`
    pub(crate) fn promote(self, now: Instant) -> Self {
        Self {
            priority: self.priority.promoted(),
            bucket_entered_at: now,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(TransferPriority::Stat < TransferPriority::High);
        assert!(TransferPriority::Low < TransferPriority::Background);
        assert_eq!(TransferPriority::Background.promoted(), TransferPriority::Low);
        assert_eq!(TransferPriority::Stat.promoted(), TransferPriority::Stat);
        assert_eq!(TransferPriority::Normal.ordinal(), 2);
    }

    #[test]
    fn test_dimse_priority_mapping() {
        assert_eq!(TransferPriority::Stat.dimse_priority(), Priority::High);
        assert_eq!(TransferPriority::Normal.dimse_priority(), Priority::Medium);
        assert_eq!(TransferPriority::Background.dimse_priority(), Priority::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_keeps_identity_and_queue_time() {
        let item = PrioritizedTransferItem::new("study", TransferPriority::Low).with_tag("batch-1");
        let queued_at = item.queued_at;
        tokio::time::advance(Duration::from_secs(5)).await;

        let promoted = item.clone().promote(Instant::now());
        assert_eq!(promoted.id, item.id);
        assert_eq!(promoted.priority, TransferPriority::Normal);
        assert_eq!(promoted.queued_at, queued_at);
        assert_eq!(promoted.tag.as_deref(), Some("batch-1"));
    }
}
