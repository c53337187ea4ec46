//! # Message Queue
//!
//! Bounded FIFO of opaque messages, protected by the kernel critical
//! section. No blocking: `enqueue` fails when full, `dequeue`/`peek`
//! return `None` when empty. Ordering is strict FIFO by enqueue time.

use alloc::collections::VecDeque;

use crate::error::{Error, Result};
use crate::sync::{critical, shared, Shared};

struct MqInner<T> {
    items: VecDeque<T>,
    capacity: usize,
    valid: bool,
}

/// A bounded message queue over an arbitrary message type.
pub struct MessageQueue<T> {
    inner: Shared<MqInner<T>>,
}

impl<T: Send> MessageQueue<T> {
    /// Create a queue holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Result<MessageQueue<T>> {
        if capacity == 0 {
            return Err(Error::Fail);
        }
        Ok(MessageQueue {
            inner: shared(MqInner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                valid: true,
            }),
        })
    }

    /// Invalidate the queue. Refused while messages remain.
    pub fn destroy(&self) -> Result<()> {
        critical(|cs| {
            let mut q = self.inner.borrow_ref_mut(cs);
            if !q.valid {
                return Err(Error::Fail);
            }
            if !q.items.is_empty() {
                return Err(Error::MqNotEmpty);
            }
            q.valid = false;
            Ok(())
        })
    }

    /// Append a message. Fails when the queue is at capacity.
    pub fn enqueue(&self, msg: T) -> Result<()> {
        critical(|cs| {
            let mut q = self.inner.borrow_ref_mut(cs);
            if !q.valid || q.items.len() >= q.capacity {
                return Err(Error::Fail);
            }
            q.items.push_back(msg);
            Ok(())
        })
    }

    /// Remove and return the oldest message.
    pub fn dequeue(&self) -> Option<T> {
        critical(|cs| self.inner.borrow_ref_mut(cs).items.pop_front())
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        critical(|cs| self.inner.borrow_ref(cs).items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + Clone> MessageQueue<T> {
    /// Copy of the oldest message without removing it.
    pub fn peek(&self) -> Option<T> {
        critical(|cs| self.inner.borrow_ref(cs).items.front().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_zero_is_rejected() {
        assert!(MessageQueue::<u32>::new(0).is_err());
    }

    #[test]
    fn test_fifo_order_and_full() {
        let q = MessageQueue::new(3).unwrap();
        q.enqueue(10u32).unwrap();
        q.enqueue(20).unwrap();
        q.enqueue(30).unwrap();
        assert_eq!(q.enqueue(40), Err(Error::Fail));

        assert_eq!(q.dequeue(), Some(10));
        assert_eq!(q.dequeue(), Some(20));
        assert_eq!(q.dequeue(), Some(30));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_enqueue_dequeue_roundtrip() {
        let q = MessageQueue::new(4).unwrap();
        q.enqueue("ping").unwrap();
        assert_eq!(q.dequeue(), Some("ping"));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let q = MessageQueue::new(2).unwrap();
        assert_eq!(q.peek(), None);
        q.enqueue(7u8).unwrap();
        assert_eq!(q.peek(), Some(7));
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue(), Some(7));
        assert!(q.is_empty());
    }

    #[test]
    fn test_destroy_refuses_non_empty() {
        let q = MessageQueue::new(2).unwrap();
        q.enqueue(1u32).unwrap();
        assert_eq!(q.destroy(), Err(Error::MqNotEmpty));
        q.dequeue();
        assert_eq!(q.destroy(), Ok(()));
        assert_eq!(q.enqueue(2), Err(Error::Fail));
    }
}
