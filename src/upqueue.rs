// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Per-handle upward message queues
//!
//! Each open control handle owns one bounded FIFO of serialized messages.
//! Producers never block: a full queue rejects the newest message with
//! `NoSpace` and mutates nothing. Readers wait asynchronously.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Hard cap on pending messages per handle.
pub const UPQUEUE_MAX_LEN: usize = 64;

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Vec<u8>>,
    closed: bool,
}

/// Bounded FIFO of serialized control messages.
#[derive(Debug, Default)]
pub struct Upqueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Upqueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a serialized message. FIFO order is preserved; overflow
    /// drops the newest message and reports `NoSpace`.
    pub fn push(&self, msg: Vec<u8>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(Error::NotFound("control handle closed".to_string()));
            }
            if inner.queue.len() >= UPQUEUE_MAX_LEN {
                return Err(Error::NoSpace("upqueue overrun".to_string()));
            }
            inner.queue.push_back(msg);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Removes the oldest message without waiting.
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Waits for the next message. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(msg) = inner.queue.pop_front() {
                    return Some(msg);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the queue closed and wakes all readers. Messages already
    /// queued remain readable.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = Upqueue::new();
        q.push(vec![1]).unwrap();
        q.push(vec![2]).unwrap();
        q.push(vec![3]).unwrap();
        assert_eq!(q.pop().await.unwrap(), vec![1]);
        assert_eq!(q.pop().await.unwrap(), vec![2]);
        assert_eq!(q.pop().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_overflow_is_no_space_without_mutation() {
        let q = Upqueue::new();
        for i in 0..UPQUEUE_MAX_LEN {
            q.push(vec![i as u8]).unwrap();
        }
        assert!(matches!(q.push(vec![0xff]), Err(Error::NoSpace(_))));
        assert_eq!(q.len(), UPQUEUE_MAX_LEN);
        // The oldest message is still the first one in.
        assert_eq!(q.try_pop().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_reader_wakes_on_push() {
        let q = Arc::new(Upqueue::new());
        let q2 = q.clone();
        let reader = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(vec![9]).unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_close_drains_then_eof() {
        let q = Upqueue::new();
        q.push(vec![1]).unwrap();
        q.close();
        assert_eq!(q.pop().await.unwrap(), vec![1]);
        assert!(q.pop().await.is_none());
        assert!(q.push(vec![2]).is_err());
    }
}
