// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present rinode Contributors

//! Timer wheel
//!
//! One wheel serves all timers of an IPCP (retransmission, inactivity,
//! enrollment, keepalive) instead of a task per timer. Expirations are
//! delivered on a channel consumed by the owner's event loop; timers are
//! cancellable by id. A cancelled timer whose expiration was already
//! delivered may still be observed once, so consumers re-check state
//! before acting.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::time::delay_queue::{DelayQueue, Key};

/// Identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

enum Cmd<T> {
    Schedule {
        id: u64,
        delay: Duration,
        payload: T,
    },
    Cancel {
        id: u64,
    },
}

/// Handle to a per-IPCP timer wheel.
pub struct TimerWheel<T> {
    cmd_tx: mpsc::UnboundedSender<Cmd<T>>,
    next_id: AtomicU64,
}

impl<T: Send + 'static> TimerWheel<T> {
    /// Spawns the wheel task. Expired payloads arrive on the returned
    /// receiver in expiration order.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_wheel(cmd_rx, out_tx));
        (
            Self {
                cmd_tx,
                next_id: AtomicU64::new(1),
            },
            out_rx,
        )
    }

    /// Schedules `payload` to fire after `delay`.
    pub fn schedule(&self, delay: Duration, payload: T) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.cmd_tx.send(Cmd::Schedule { id, delay, payload });
        TimerId(id)
    }

    /// Cancels a scheduled timer. Unknown or already-fired ids are ignored.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.cmd_tx.send(Cmd::Cancel { id: id.0 });
    }
}

async fn run_wheel<T: Send + 'static>(
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd<T>>,
    out_tx: mpsc::UnboundedSender<T>,
) {
    let mut queue: DelayQueue<(u64, T)> = DelayQueue::new();
    let mut keys: HashMap<u64, Key> = HashMap::new();

    loop {
        if queue.is_empty() {
            // Nothing armed: only a command can make progress.
            match cmd_rx.recv().await {
                Some(cmd) => handle_cmd(cmd, &mut queue, &mut keys),
                None => break,
            }
            continue;
        }

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => handle_cmd(cmd, &mut queue, &mut keys),
                None => break,
            },
            expired = poll_fn(|cx| queue.poll_expired(cx)) => {
                if let Some(expired) = expired {
                    let (id, payload) = expired.into_inner();
                    keys.remove(&id);
                    if out_tx.send(payload).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn handle_cmd<T>(cmd: Cmd<T>, queue: &mut DelayQueue<(u64, T)>, keys: &mut HashMap<u64, Key>) {
    match cmd {
        Cmd::Schedule { id, delay, payload } => {
            let key = queue.insert((id, payload), delay);
            keys.insert(id, key);
        }
        Cmd::Cancel { id } => {
            if let Some(key) = keys.remove(&id) {
                queue.try_remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_fires_after_delay() {
        let (wheel, mut rx) = TimerWheel::new();
        let start = Instant::now();
        wheel.schedule(Duration::from_millis(50), "tick");
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, "tick");
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let (wheel, mut rx) = TimerWheel::new();
        let id = wheel.schedule(Duration::from_millis(50), "cancelled");
        wheel.cancel(id);
        wheel.schedule(Duration::from_millis(100), "kept");
        assert_eq!(rx.recv().await.unwrap(), "kept");
    }

    #[tokio::test]
    async fn test_expiration_order() {
        let (wheel, mut rx) = TimerWheel::new();
        wheel.schedule(Duration::from_millis(80), 2u32);
        wheel.schedule(Duration::from_millis(30), 1u32);
        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }
}
