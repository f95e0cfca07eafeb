//! Work queue carrying batch tokens from transfer to handlers.
//!
//! Delivery is at-least-once: a received message stays unacknowledged until
//! `ack`; `requeue` (or, for durable queues, a visibility timeout) makes it
//! deliverable again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use ::async_trait::async_trait;
use warrant_core::{QueueError, WarrantResult};

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub token: String,
    /// 1 on first delivery.
    pub attempt: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, tokens: &[String]) -> WarrantResult<()>;

    /// Next deliverable message, or `None` if the queue is idle.
    async fn receive(&self) -> WarrantResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> WarrantResult<()>;

    async fn requeue(&self, delivery: &Delivery) -> WarrantResult<()>;
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    ready: VecDeque<Delivery>,
    unacked: HashMap<i64, Delivery>,
}

/// Process-local queue.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    rejecting_publish: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish` fail, to exercise the pending-batch recovery path.
    pub fn set_rejecting_publish(&self, rejecting: bool) {
        self.rejecting_publish.store(rejecting, Ordering::SeqCst);
    }

    fn lock(&self) -> WarrantResult<std::sync::MutexGuard<'_, QueueState>> {
        self.state.lock().map_err(|_| {
            QueueError::ReceiveFailed {
                reason: "queue state poisoned".to_string(),
            }
            .into()
        })
    }

    /// Tokens waiting for delivery, in order.
    pub fn ready_tokens(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.ready.iter().map(|d| d.token.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_len(&self) -> usize {
        self.state.lock().map(|s| s.unacked.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn publish(&self, tokens: &[String]) -> WarrantResult<()> {
        if self.rejecting_publish.load(Ordering::SeqCst) {
            return Err(QueueError::PublishFailed {
                reason: "queue rejecting publishes".to_string(),
            }
            .into());
        }
        let mut state = self.lock()?;
        for token in tokens {
            state.next_id += 1;
            let id = state.next_id;
            state.ready.push_back(Delivery {
                id,
                token: token.clone(),
                attempt: 0,
            });
        }
        Ok(())
    }

    async fn receive(&self) -> WarrantResult<Option<Delivery>> {
        let mut state = self.lock()?;
        let Some(mut delivery) = state.ready.pop_front() else {
            return Ok(None);
        };
        delivery.attempt += 1;
        state.unacked.insert(delivery.id, delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> WarrantResult<()> {
        self.lock()?.unacked.remove(&delivery.id);
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> WarrantResult<()> {
        let mut state = self.lock()?;
        if let Some(pending) = state.unacked.remove(&delivery.id) {
            state.ready.push_back(pending);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_with_ack() {
        let queue = InMemoryQueue::new();
        queue
            .publish(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.token, "a");
        assert_eq!(first.attempt, 1);
        assert_eq!(queue.unacked_len(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.unacked_len(), 0);
        assert_eq!(queue.ready_tokens(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_higher_attempt() {
        let queue = InMemoryQueue::new();
        queue.publish(&["a".to_string()]).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        queue.requeue(&first).await.unwrap();

        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejecting_publish() {
        let queue = InMemoryQueue::new();
        queue.set_rejecting_publish(true);
        let err = queue.publish(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
        assert!(queue.ready_tokens().is_empty());
    }
}
