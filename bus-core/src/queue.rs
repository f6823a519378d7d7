// bus-core/src/queue.rs

//! Thread-safe inbound message queue.
//!
//! Unbounded FIFO owned by one process: written to by concurrent inbound-call
//! handlers, read by the single dispatch-loop consumer. The queue owns its
//! synchronization; callers only see `push`/`pop`. `pop` suspends while the
//! queue is empty and wakes exactly on enqueue, so an idle consumer burns no
//! CPU.

use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::message::Message;

pub struct InboundQueue {
    // Taken on close so producers observe shutdown.
    tx: StdMutex<Option<UnboundedSender<Message>>>,
    rx: Mutex<UnboundedReceiver<Message>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }

    /// Enqueues a message. Returns `false` once the queue has been closed.
    pub fn push(&self, message: Message) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Dequeues the next message, suspending while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Closes the queue; pending messages remain poppable, further pushes are
    /// rejected.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn message(n: u32) -> Message {
        Message::new(format!("m{n}"), 0, 1)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = InboundQueue::new();
        for n in 0..5 {
            assert!(queue.push(message(n)));
        }
        for n in 0..5 {
            assert_eq!(queue.pop().await.unwrap().msg_type(), format!("m{n}"));
        }
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(InboundQueue::new());
        let producer = queue.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(message(0));
        });

        let popped = tokio::time::timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("pop should wake on push");
        assert!(popped.is_some());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_push_and_drains() {
        let queue = InboundQueue::new();
        assert!(queue.push(message(0)));
        queue.close();
        assert!(!queue.push(message(1)));

        // Already-queued message is still poppable, then the queue ends.
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }
}
