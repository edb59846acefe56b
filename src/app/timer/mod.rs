// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Stage timers.
//!
//! One tokio task owns every timer in the process. Firings are never run on
//! the timer task itself; each one is posted as a work item to the owning
//! stage's worker, so timer callbacks obey the per-stage ordering rules.

mod game_loop;

pub use game_loop::GameLoop;

use crate::app::event_loop::{PoolHandle, WorkItem};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};

/// A process-unique timer identifier.
pub type TimerId = u64;

/// The process-global timer id generator; ids are never reused.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

fn next_timer_id() -> TimerId {
    NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub(crate) enum TimerCmd {
    Add {
        timer_id: TimerId,
        stage_id: i64,
        delay: Duration,
        period: Duration,
        /// `None` repeats forever; `Some(n)` auto-cancels after `n` firings.
        remaining: Option<u32>,
    },
    Cancel(TimerId),
    CancelStage(i64),
    Shutdown,
}

/// Registers and cancels timers. Cheap to clone.
#[derive(Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerCmd>,
}

impl TimerHandle {
    /// Start the timer task, posting firings into `pool`.
    pub(crate) fn start(pool: PoolHandle) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run(rx, pool));
        (Self { tx }, join)
    }

    /// Fire at `now + delay`, then every `period`, until cancelled.
    pub fn add_repeat(&self, stage_id: i64, delay: Duration, period: Duration) -> TimerId {
        let timer_id = next_timer_id();
        self.send(TimerCmd::Add {
            timer_id,
            stage_id,
            delay,
            period,
            remaining: None,
        });
        timer_id
    }

    /// Like `add_repeat` but auto-cancels after `count` firings (at least one).
    pub fn add_count(&self, stage_id: i64, delay: Duration, period: Duration, count: u32) -> TimerId {
        let timer_id = next_timer_id();
        self.send(TimerCmd::Add {
            timer_id,
            stage_id,
            delay,
            period,
            remaining: Some(count.max(1)),
        });
        timer_id
    }

    /// Remove a timer. Cancelling an unknown or already-fired timer is a no-op.
    pub fn cancel(&self, timer_id: TimerId) {
        self.send(TimerCmd::Cancel(timer_id));
    }

    /// Remove every timer owned by `stage_id`.
    pub(crate) fn cancel_stage(&self, stage_id: i64) {
        self.send(TimerCmd::CancelStage(stage_id));
    }

    pub(crate) fn shutdown(&self) {
        self.send(TimerCmd::Shutdown);
    }

    fn send(&self, cmd: TimerCmd) {
        if self.tx.send(cmd).is_err() {
            log::warn!("Timer task is gone; command dropped");
        }
    }
}

struct TimerState {
    stage_id: i64,
    period: Duration,
    remaining: Option<u32>,
    next_fire: Instant,
}

async fn run(mut rx: mpsc::UnboundedReceiver<TimerCmd>, pool: PoolHandle) {
    let mut timers: HashMap<TimerId, TimerState> = HashMap::new();
    // Heap entries go stale on cancel/reschedule; an entry is live only if it
    // matches its timer's current `next_fire`.
    let mut queue: BinaryHeap<Reverse<(Instant, TimerId)>> = BinaryHeap::new();
    loop {
        let next_deadline = queue
            .peek()
            .map(|Reverse((when, _))| *when)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(TimerCmd::Add { timer_id, stage_id, delay, period, remaining }) => {
                    let next_fire = Instant::now() + delay;
                    timers.insert(timer_id, TimerState { stage_id, period, remaining, next_fire });
                    queue.push(Reverse((next_fire, timer_id)));
                }
                Some(TimerCmd::Cancel(timer_id)) => {
                    timers.remove(&timer_id);
                }
                Some(TimerCmd::CancelStage(stage_id)) => {
                    timers.retain(|_, state| state.stage_id != stage_id);
                }
                Some(TimerCmd::Shutdown) | None => break,
            },
            _ = sleep_until(next_deadline) => {
                let now = Instant::now();
                while let Some(Reverse((when, timer_id))) = queue.peek().copied() {
                    if when > now {
                        break;
                    }
                    queue.pop();
                    let state = match timers.get_mut(&timer_id) {
                        Some(state) if state.next_fire == when => state,
                        _ => continue, // stale entry
                    };
                    pool.post(state.stage_id, WorkItem::Timer { stage_id: state.stage_id, timer_id });
                    match state.remaining.as_mut() {
                        Some(remaining) => {
                            *remaining -= 1;
                            if *remaining == 0 {
                                timers.remove(&timer_id);
                                continue;
                            }
                        }
                        None => {}
                    }
                    state.next_fire = when + state.period;
                    queue.push(Reverse((state.next_fire, timer_id)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::event_loop;

    #[tokio::test]
    async fn count_timers_auto_cancel() {
        let (pool, mut rxs) = event_loop::mailboxes(1);
        let (timers, join) = TimerHandle::start(pool);
        timers.add_count(5, Duration::from_millis(10), Duration::from_millis(10), 3);
        let mut rx = rxs.remove(0);
        let mut fired = 0;
        while fired < 3 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(WorkItem::Timer { stage_id, .. })) => {
                    assert_eq!(stage_id, 5);
                    fired += 1;
                }
                other => panic!("expected a timer firing, got {:?}", other.map(|_| "item")),
            }
        }
        // A fourth firing never arrives.
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        timers.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (pool, mut rxs) = event_loop::mailboxes(1);
        let (timers, join) = TimerHandle::start(pool);
        let id = timers.add_repeat(9, Duration::from_millis(20), Duration::from_millis(20));
        timers.cancel(id);
        timers.cancel(id);
        let mut rx = rxs.remove(0);
        assert!(tokio::time::timeout(Duration::from_millis(80), rx.recv()).await.is_err());
        timers.shutdown();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn stage_destruction_cancels_in_bulk() {
        let (pool, mut rxs) = event_loop::mailboxes(1);
        let (timers, join) = TimerHandle::start(pool);
        timers.add_repeat(3, Duration::from_millis(15), Duration::from_millis(15));
        timers.add_repeat(3, Duration::from_millis(25), Duration::from_millis(25));
        timers.add_repeat(4, Duration::from_millis(20), Duration::from_millis(20));
        timers.cancel_stage(3);
        let mut rx = rxs.remove(0);
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(WorkItem::Timer { stage_id, .. })) => assert_eq!(stage_id, 4),
            other => panic!("expected stage 4's timer, got {:?}", other.map(|_| "item")),
        }
        timers.shutdown();
        join.await.unwrap();
    }
}
