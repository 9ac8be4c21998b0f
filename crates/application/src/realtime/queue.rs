//! 每个连接的有界出站队列
//!
//! 队列满时丢弃最旧的消息为新消息腾位置。写端连续一整个队列容量的丢弃
//! 都没有取走任何消息时，判定为持续慢消费者，队列关闭。

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 入队成功，但丢弃了最旧的一条
    DroppedOldest,
    /// 持续溢出，队列已关闭
    Overflowed,
    Closed,
}

struct QueueState {
    items: VecDeque<Vec<u8>>,
    consecutive_drops: usize,
    closed: bool,
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                consecutive_drops: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn push(&self, message: Vec<u8>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            if state.items.len() < self.capacity {
                state.items.push_back(message);
                PushOutcome::Queued
            } else {
                state.items.pop_front();
                state.items.push_back(message);
                state.consecutive_drops += 1;

                if state.consecutive_drops >= self.capacity {
                    state.closed = true;
                    state.items.clear();
                    PushOutcome::Overflowed
                } else {
                    PushOutcome::DroppedOldest
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// 等待下一条消息，队列关闭后返回 `None`
    pub async fn next(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(message) = state.items.pop_front() {
                    state.consecutive_drops = 0;
                    return Some(message);
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let queue = OutboundQueue::new(2);
        assert_eq!(queue.push(b"1".to_vec()), PushOutcome::Queued);
        assert_eq!(queue.push(b"2".to_vec()), PushOutcome::Queued);
        assert_eq!(queue.push(b"3".to_vec()), PushOutcome::DroppedOldest);

        assert_eq!(queue.next().await.unwrap(), b"2");
        assert_eq!(queue.next().await.unwrap(), b"3");
    }

    #[tokio::test]
    async fn persistent_overflow_closes_queue() {
        let queue = OutboundQueue::new(2);
        queue.push(b"1".to_vec());
        queue.push(b"2".to_vec());
        assert_eq!(queue.push(b"3".to_vec()), PushOutcome::DroppedOldest);
        assert_eq!(queue.push(b"4".to_vec()), PushOutcome::Overflowed);

        assert!(queue.is_closed());
        assert_eq!(queue.push(b"5".to_vec()), PushOutcome::Closed);
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn draining_resets_drop_streak() {
        let queue = OutboundQueue::new(2);
        queue.push(b"1".to_vec());
        queue.push(b"2".to_vec());
        assert_eq!(queue.push(b"3".to_vec()), PushOutcome::DroppedOldest);

        queue.next().await.unwrap();
        queue.push(b"4".to_vec());
        assert_eq!(queue.push(b"5".to_vec()), PushOutcome::DroppedOldest);
        assert!(!queue.is_closed());
    }

    #[tokio::test]
    async fn waiting_reader_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(4));
        let reader = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.push(b"hello".to_vec());

        assert_eq!(reader.await.unwrap().unwrap(), b"hello");
    }
}
