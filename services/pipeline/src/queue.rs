//! In-process work queue with visibility timeouts and dead-letter redrive.
//!
//! Delivery is at-least-once: a received message stays hidden for the
//! visibility timeout and reappears unless it is acknowledged. Every delivery
//! bumps the message's receive counter; once the counter has reached the
//! redrive threshold the message is moved to the dead-letter queue instead of
//! being delivered again.

use crate::event::RoutedEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors returned by queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue {0} has no dead-letter queue configured")]
    NoDeadLetterQueue(String),
}

/// Handle identifying one delivery of a message.
///
/// A receipt is replaced on every redelivery, so a consumer that lost its
/// lease cannot acknowledge the message out from under the new owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(Uuid);

impl Receipt {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    pub event: RoutedEvent,
    pub receipt: Receipt,
    /// Number of times this message has been delivered, this delivery included
    pub receive_count: u32,
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    /// Messages ready for delivery
    pub visible: usize,
    /// Messages currently hidden (in flight or delayed)
    pub in_flight: usize,
    pub total: usize,
}

struct Entry {
    message_id: Uuid,
    event: RoutedEvent,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<Receipt>,
}

impl Entry {
    fn new(event: RoutedEvent) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            event,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        }
    }
}

struct RedrivePolicy {
    dead_letter: Arc<WorkQueue>,
    max_receive_count: u32,
}

/// Work queue with long-poll receive, visibility timeout and redrive
pub struct WorkQueue {
    name: String,
    visibility_timeout: Duration,
    redrive: Option<RedrivePolicy>,
    entries: Mutex<VecDeque<Entry>>,
    available: Notify,
}

impl WorkQueue {
    /// Create a queue without a dead-letter queue
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            redrive: None,
            entries: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    /// Attach a dead-letter queue.
    ///
    /// The dead-letter queue must not itself redrive back into this queue.
    pub fn with_dead_letter(mut self, dead_letter: Arc<WorkQueue>, max_receive_count: u32) -> Self {
        self.redrive = Some(RedrivePolicy {
            dead_letter,
            max_receive_count: max_receive_count.max(1),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// The dead-letter queue, if one is attached
    pub fn dead_letter_queue(&self) -> Option<&Arc<WorkQueue>> {
        self.redrive.as_ref().map(|r| &r.dead_letter)
    }

    /// Add an event to the queue, returning its message ID
    pub fn enqueue(&self, event: RoutedEvent) -> Uuid {
        let entry = Entry::new(event);
        let message_id = entry.message_id;

        debug!(queue = %self.name, message_id = %message_id, key = %entry.event.object_key, "Enqueued event");

        self.entries.lock().push_back(entry);
        self.available.notify_waiters();
        metrics::counter!("pipeline.queue.enqueued", "queue" => self.name.clone()).increment(1);

        message_id
    }

    /// Receive up to `max_batch` messages, waiting up to `wait` for the first one.
    pub async fn receive(&self, max_batch: usize, wait: Duration) -> Vec<ReceivedMessage> {
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking, so an enqueue between the
            // scan and the wait is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_visible) = self.take_visible(max_batch);
            if !batch.is_empty() || max_batch == 0 {
                return batch;
            }

            let now = Instant::now();
            if now >= deadline {
                return batch;
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Claim visible messages, redriving the ones that exhausted their budget
    fn take_visible(&self, max_batch: usize) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut entries = self.entries.lock();

        let mut index = 0;
        while index < entries.len() && batch.len() < max_batch {
            let entry = &mut entries[index];

            if entry.visible_at > now {
                next_visible = Some(next_visible.map_or(entry.visible_at, |at| at.min(entry.visible_at)));
                index += 1;
                continue;
            }

            if let Some(ref redrive) = self.redrive {
                if entry.receive_count >= redrive.max_receive_count {
                    if let Some(expired) = entries.remove(index) {
                        warn!(
                            queue = %self.name,
                            dead_letter_queue = %redrive.dead_letter.name,
                            message_id = %expired.message_id,
                            key = %expired.event.object_key,
                            receive_count = expired.receive_count,
                            "Receive budget exhausted, moving message to dead-letter queue"
                        );
                        // Pushed while our lock is held, so the message is never
                        // observable in both queues or in neither.
                        redrive.dead_letter.push_dead_letter(expired.event);
                        metrics::counter!("pipeline.queue.dead_lettered", "queue" => self.name.clone())
                            .increment(1);
                    }
                    continue;
                }
            }

            let receipt = Receipt::new();
            entry.receive_count += 1;
            entry.visible_at = now + self.visibility_timeout;
            entry.receipt = Some(receipt);

            batch.push(ReceivedMessage {
                message_id: entry.message_id,
                event: entry.event.clone(),
                receipt,
                receive_count: entry.receive_count,
            });
            index += 1;
        }

        if !batch.is_empty() {
            metrics::counter!("pipeline.queue.received", "queue" => self.name.clone())
                .increment(batch.len() as u64);
        }

        (batch, next_visible)
    }

    fn push_dead_letter(&self, event: RoutedEvent) {
        self.entries.lock().push_back(Entry::new(event));
        self.available.notify_waiters();
    }

    /// Acknowledge a delivery, removing the message.
    ///
    /// Returns `false` when the receipt is stale (the message was redelivered
    /// or already removed).
    pub fn ack(&self, receipt: Receipt) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.receipt == Some(receipt)) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => {
                debug!(queue = %self.name, receipt = %receipt, "Ack for stale receipt ignored");
                false
            }
        }
    }

    /// Make a delivered message visible again after `delay`
    pub fn release(&self, receipt: Receipt, delay: Duration) -> bool {
        let released = {
            let mut entries = self.entries.lock();
            match entries.iter_mut().find(|e| e.receipt == Some(receipt)) {
                Some(entry) => {
                    entry.visible_at = Instant::now() + delay;
                    entry.receipt = None;
                    true
                }
                None => false,
            }
        };

        if released {
            self.available.notify_waiters();
        }
        released
    }

    /// Move a delivered message straight to the dead-letter queue.
    ///
    /// Used for terminal failures, where spending the rest of the receive
    /// budget cannot change the outcome.
    pub fn dead_letter(&self, receipt: Receipt, reason: &str) -> Result<bool, QueueError> {
        let redrive = self
            .redrive
            .as_ref()
            .ok_or_else(|| QueueError::NoDeadLetterQueue(self.name.clone()))?;

        let mut entries = self.entries.lock();
        let Some(index) = entries.iter().position(|e| e.receipt == Some(receipt)) else {
            return Ok(false);
        };

        if let Some(entry) = entries.remove(index) {
            warn!(
                queue = %self.name,
                dead_letter_queue = %redrive.dead_letter.name,
                message_id = %entry.message_id,
                key = %entry.event.object_key,
                reason = %reason,
                "Dead-lettering message"
            );
            redrive.dead_letter.push_dead_letter(entry.event);
            metrics::counter!("pipeline.queue.dead_lettered", "queue" => self.name.clone()).increment(1);
        }

        Ok(true)
    }

    /// Number of messages held, visible or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let entries = self.entries.lock();
        let visible = entries.iter().filter(|e| e.visible_at <= now).count();

        QueueStats {
            name: self.name.clone(),
            visible,
            in_flight: entries.len() - visible,
            total: entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn redriving_queue(max_receive_count: u32) -> (Arc<WorkQueue>, Arc<WorkQueue>) {
        let dlq = Arc::new(WorkQueue::new("test-dlq", VISIBILITY));
        let queue = Arc::new(WorkQueue::new("test", VISIBILITY).with_dead_letter(dlq.clone(), max_receive_count));
        (queue, dlq)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_after_visibility_timeout() {
        let queue = WorkQueue::new("test", VISIBILITY);
        queue.enqueue(RoutedEvent::created("images", "a.png"));

        let first = queue.receive(10, Duration::ZERO).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        // Hidden while in flight
        assert!(queue.receive(10, Duration::ZERO).await.is_empty());

        let second = queue.receive(10, VISIBILITY + Duration::from_secs(1)).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(first[0].receipt, second[0].receipt);

        // The old receipt lost its lease
        assert!(!queue.ack(first[0].receipt));
        assert!(queue.ack(second[0].receipt));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_budget_moves_message_to_dead_letter_queue_once() {
        let (queue, dlq) = redriving_queue(2);
        queue.enqueue(RoutedEvent::created("images", "flaky.png"));

        let mut deliveries = 0;
        for _ in 0..5 {
            let batch = queue.receive(1, VISIBILITY * 2).await;
            deliveries += batch.len();
        }

        assert_eq!(deliveries, 2);
        assert!(queue.is_empty());
        assert_eq!(dlq.len(), 1);

        let dead = dlq.receive(10, Duration::ZERO).await;
        assert_eq!(dead[0].event.object_key, "flaky.png");
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_ack() {
        let queue = WorkQueue::new("test", VISIBILITY);
        for key in ["1.png", "2.png", "3.png", "4.png", "5.png"] {
            queue.enqueue(RoutedEvent::created("images", key));
        }

        let batch = queue.receive(5, Duration::ZERO).await;
        assert_eq!(batch.len(), 5);
        for message in &batch[..3] {
            assert!(queue.ack(message.receipt));
        }

        let stats = queue.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.in_flight, 2);

        let redelivered = queue.receive(5, VISIBILITY + Duration::from_secs(1)).await;
        let keys: Vec<_> = redelivered.iter().map(|m| m.event.object_key.as_str()).collect();
        assert_eq!(keys, vec!["4.png", "5.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_enqueue() {
        let queue = Arc::new(WorkQueue::new("test", VISIBILITY));

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            producer.enqueue(RoutedEvent::created("images", "late.png"));
        });

        let started = Instant::now();
        let batch = queue.receive(5, Duration::from_secs(10)).await;
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let queue = WorkQueue::new("test", VISIBILITY);
        let started = Instant::now();

        assert!(queue.receive(5, Duration::from_secs(3)).await.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_short_circuits_budget() {
        let (queue, dlq) = redriving_queue(5);
        queue.enqueue(RoutedEvent::created("images", "doc.pdf"));

        let batch = queue.receive(1, Duration::ZERO).await;
        assert!(queue.dead_letter(batch[0].receipt, "unsupported").unwrap());

        assert!(queue.is_empty());
        assert_eq!(dlq.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_without_redrive_is_an_error() {
        let queue = WorkQueue::new("test", VISIBILITY);
        queue.enqueue(RoutedEvent::created("images", "doc.pdf"));

        let batch = queue.receive(1, Duration::ZERO).await;
        assert!(matches!(
            queue.dead_letter(batch[0].receipt, "unsupported"),
            Err(QueueError::NoDeadLetterQueue(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_makes_message_visible() {
        let queue = WorkQueue::new("test", VISIBILITY);
        queue.enqueue(RoutedEvent::created("images", "a.png"));

        let batch = queue.receive(1, Duration::ZERO).await;
        assert!(queue.release(batch[0].receipt, Duration::ZERO));

        let again = queue.receive(1, Duration::ZERO).await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
    }
}
