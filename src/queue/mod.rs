//! Transfer Priority Queue
//!
//! One FIFO bucket per [`TransferPriority`]; `dequeue` always serves the
//! highest non-empty bucket. All mutation happens under a single mutex that
//! is never held across an await point. Expiry, eviction, promotion and
//! cancellation are published on a broadcast channel. Items that leave the
//! queue without being dequeued are also sent, without loss, to the
//! outcome feed returned by [`TransferQueue::track_outcomes`].

mod item;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, TransferError};

pub use item::{PrioritizedTransferItem, TransferPriority};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued items across all priorities
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Evict droppable lower priority items when full
    #[serde(default = "default_true")]
    pub allow_dropping: bool,

    /// Promote items waiting longer than this in one bucket. Unset disables aging.
    #[serde(default = "default_aging_interval")]
    pub aging_interval_ms: Option<u64>,
}

fn default_capacity() -> usize {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_aging_interval() -> Option<u64> {
    Some(300_000)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            allow_dropping: true,
            aging_interval_ms: default_aging_interval(),
        }
    }
}

impl QueueConfig {
    pub fn aging_interval(&self) -> Option<Duration> {
        self.aging_interval_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TransferError::config("queue.capacity must be greater than 0"));
        }
        if self.aging_interval_ms == Some(0) {
            return Err(TransferError::config(
                "queue.aging_interval_ms must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

/// Queue lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    ItemExpired {
        id: Uuid,
        priority: TransferPriority,
        tag: Option<String>,
    },
    /// Evicted to make room for a higher priority item
    ItemDropped {
        id: Uuid,
        priority: TransferPriority,
        tag: Option<String>,
    },
    ItemPromoted {
        id: Uuid,
        from: TransferPriority,
        to: TransferPriority,
    },
    ItemCancelled {
        id: Uuid,
        tag: Option<String>,
    },
}

impl QueueEvent {
    /// Whether the item left the queue without being dequeued
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueEvent::ItemPromoted { .. })
    }
}

/// Read-only statistics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub processed: u64,
    pub dropped: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub average_wait: Duration,
    pub depth: BTreeMap<TransferPriority, usize>,
}

impl QueueStats {
    pub fn total_depth(&self) -> usize {
        self.depth.values().sum()
    }
}

struct QueueState<T> {
    buckets: [VecDeque<PrioritizedTransferItem<T>>; 5],
    processed: u64,
    dropped: u64,
    expired: u64,
    cancelled: u64,
    total_wait: Duration,
}

impl<T> QueueState<T> {
    fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }
}

pub struct TransferQueue<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    available: Notify,
    events: broadcast::Sender<QueueEvent>,
    outcomes: Mutex<Option<mpsc::UnboundedSender<QueueEvent>>>,
}

impl<T> TransferQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            state: Mutex::new(QueueState {
                buckets: Default::default(),
                processed: 0,
                dropped: 0,
                expired: 0,
                cancelled: 0,
                total_wait: Duration::ZERO,
            }),
            available: Notify::new(),
            events,
            outcomes: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: QueueEvent) {
        if event.is_terminal() {
            let mut outcomes = self.outcomes.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tx) = outcomes.as_ref() {
                if tx.send(event.clone()).is_err() {
                    *outcomes = None;
                }
            }
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Broadcast of every queue event. Slow subscribers may lag and miss
    /// events; use [`track_outcomes`](Self::track_outcomes) when each
    /// terminal event must be seen.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Unbounded feed of expired, dropped and cancelled items, starting now.
    /// Replaces any previous feed.
    pub fn track_outcomes(&self) -> mpsc::UnboundedReceiver<QueueEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outcomes.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        rx
    }

    /// Add an item, evicting the oldest droppable item of a strictly lower
    /// priority when the queue is full.
    pub fn enqueue(&self, item: PrioritizedTransferItem<T>) -> Result<Uuid> {
        let item = item.stamp(Instant::now());
        let id = item.id;
        let mut events = Vec::new();
        {
            let mut state = self.lock();
            if state.len() >= self.config.capacity {
                let victim = if self.config.allow_dropping {
                    evict(&mut state, item.priority)
                } else {
                    None
                };
                let Some(victim) = victim else {
                    warn!(
                        "Transfer queue full ({}), rejecting {} item",
                        self.config.capacity, item.priority
                    );
                    return Err(TransferError::QueueFull {
                        capacity: self.config.capacity,
                    });
                };
                debug!(
                    "Dropped {} item {} for {} item {}",
                    victim.priority, victim.id, item.priority, id
                );
                state.dropped += 1;
                events.push(QueueEvent::ItemDropped {
                    id: victim.id,
                    priority: victim.priority,
                    tag: victim.tag,
                });
            }
            state.buckets[item.priority.ordinal()].push_back(item);
        }
        for event in events {
            self.publish(event);
        }
        self.available.notify_one();
        Ok(id)
    }

    /// Take the next item: expired items are removed and reported first,
    /// then items past the aging interval move up one level.
    pub fn dequeue(&self) -> Option<PrioritizedTransferItem<T>> {
        let now = Instant::now();
        let mut events = Vec::new();
        let next = {
            let mut state = self.lock();

            for bucket in state.buckets.iter_mut() {
                if !bucket.iter().any(|item| item.is_expired(now)) {
                    continue;
                }
                let (expired, kept): (VecDeque<_>, VecDeque<_>) =
                    bucket.drain(..).partition(|item| item.is_expired(now));
                *bucket = kept;
                for item in expired {
                    events.push(QueueEvent::ItemExpired {
                        id: item.id,
                        priority: item.priority,
                        tag: item.tag,
                    });
                }
            }
            state.expired += events.len() as u64;

            if let Some(interval) = self.config.aging_interval() {
                // Stat has nowhere to go. Walking from High down moves an item
                // at most one level per pass.
                for ordinal in 1..state.buckets.len() {
                    let bucket = &mut state.buckets[ordinal];
                    let split = bucket
                        .iter()
                        .take_while(|item| {
                            now.saturating_duration_since(item.bucket_entered_at) >= interval
                        })
                        .count();
                    let aged: Vec<_> = bucket.drain(..split).collect();
                    for item in aged {
                        let from = item.priority;
                        let promoted = item.promote(now);
                        events.push(QueueEvent::ItemPromoted {
                            id: promoted.id,
                            from,
                            to: promoted.priority,
                        });
                        state.buckets[ordinal - 1].push_back(promoted);
                    }
                }
            }

            let next = state.buckets.iter_mut().find_map(VecDeque::pop_front);
            if let Some(item) = &next {
                state.processed += 1;
                state.total_wait += item.waited(now);
            }
            next
        };
        for event in events {
            self.publish(event);
        }
        next
    }

    /// Remove every queued item carrying `tag`
    pub fn dequeue_tag(&self, tag: &str) -> Vec<PrioritizedTransferItem<T>> {
        let removed: Vec<_> = {
            let mut state = self.lock();
            let mut removed = Vec::new();
            for bucket in state.buckets.iter_mut() {
                let (matching, kept): (VecDeque<_>, VecDeque<_>) = bucket
                    .drain(..)
                    .partition(|item| item.tag.as_deref() == Some(tag));
                *bucket = kept;
                removed.extend(matching);
            }
            state.cancelled += removed.len() as u64;
            removed
        };
        for item in &removed {
            self.publish(QueueEvent::ItemCancelled {
                id: item.id,
                tag: item.tag.clone(),
            });
        }
        removed
    }

    /// Remove one queued item by id
    pub fn remove(&self, id: Uuid) -> Option<PrioritizedTransferItem<T>> {
        let removed = {
            let mut state = self.lock();
            let removed = state.buckets.iter_mut().find_map(|bucket| {
                let index = bucket.iter().position(|item| item.id == id)?;
                bucket.remove(index)
            });
            if removed.is_some() {
                state.cancelled += 1;
            }
            removed
        };
        if let Some(item) = &removed {
            self.publish(QueueEvent::ItemCancelled {
                id: item.id,
                tag: item.tag.clone(),
            });
        }
        removed
    }

    /// Wait for the next item. Returns `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<PrioritizedTransferItem<T>> {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.dequeue() {
                return Some(item);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let average_wait = if state.processed == 0 {
            Duration::ZERO
        } else {
            state.total_wait / state.processed.min(u32::MAX as u64) as u32
        };
        QueueStats {
            processed: state.processed,
            dropped: state.dropped,
            expired: state.expired,
            cancelled: state.cancelled,
            average_wait,
            depth: TransferPriority::ALL
                .iter()
                .map(|p| (*p, state.buckets[p.ordinal()].len()))
                .collect(),
        }
    }
}

/// Oldest droppable item in the lowest bucket strictly below `incoming`
fn evict<T>(
    state: &mut QueueState<T>,
    incoming: TransferPriority,
) -> Option<PrioritizedTransferItem<T>> {
    for ordinal in (incoming.ordinal() + 1..state.buckets.len()).rev() {
        let bucket = &mut state.buckets[ordinal];
        if let Some(index) = bucket.iter().position(|item| item.droppable) {
            return bucket.remove(index);
        }
    }
    None
}
