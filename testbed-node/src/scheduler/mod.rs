/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Single-consumer timed event scheduler.
//!
//! [`Scheduler`] keeps a queue of `(due, priority, action)` entries and runs
//! them one at a time on the calling thread:
//!
//! * ascending due time (monotonic [`Instant`]),
//! * then ascending priority (lower value first),
//! * then insertion order.
//!
//! # Design
//!
//! | Topic | Choice |
//! |---|---|
//! | Queue | `BTreeMap` keyed by `(due, priority, seq)`: ordered pop and O(log n) cancel by handle |
//! | Clock | `Instant`: wall-clock jumps never reorder or stall the timeline |
//! | Ownership | One owner, one thread; other threads talk to the owner over a channel (see [`run_interruptible`](Scheduler::run_interruptible)) |
//! | Failures | The first failing action stops the loop and its error is returned; remaining events stay queued |
//!
//! # Example
//! ```rust,ignore
//! let mut sched: Scheduler<anyhow::Error> = Scheduler::new();
//! let h = sched.schedule_in(Duration::from_secs(5), 1, || Ok(()));
//! sched.cancel(h)?;
//! sched.run()?;
//! ```

pub mod error;

pub use error::ScheduleError;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

/// A zero-argument timeline action.
pub type Action<E> = Box<dyn FnOnce() -> Result<(), E> + Send + 'static>;

// ── Event handle ──────────────────────────────────────────────────────────────

/// Handle to one scheduled event, returned by the `schedule_*` methods.
///
/// Field order gives the execution order, so the handle doubles as the queue
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventHandle {
    due: Instant,
    priority: u32,
    seq: u64,
}

impl EventHandle {
    pub fn due(&self) -> Instant {
        self.due
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }
}

/// How [`Scheduler::run_interruptible`] returned.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome<C> {
    /// Every event ran.
    Drained,
    /// A control message arrived before the next event was due.  Pending
    /// events are left queued for the caller to deal with.
    Interrupted(C),
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct Scheduler<E> {
    queue: BTreeMap<EventHandle, Action<E>>,
    next_seq: u64,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self {
            queue: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<E> std::fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.queue.len())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run `delay` from now.
    pub fn schedule_in<F>(&mut self, delay: Duration, priority: u32, action: F) -> EventHandle
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, priority, action)
    }

    /// Schedule `action` to run at the absolute instant `due`.
    ///
    /// A `due` in the past means "as soon as the loop gets to it".
    pub fn schedule_at<F>(&mut self, due: Instant, priority: u32, action: F) -> EventHandle
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
    {
        let handle = EventHandle {
            due,
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.queue.insert(handle, Box::new(action));
        trace!(seq = handle.seq, priority, pending = self.queue.len(), "event scheduled");
        handle
    }

    /// Remove a pending event.
    ///
    /// # Errors
    /// [`ScheduleError::NotFound`] if the event already fired, was cancelled
    /// before, or is unknown.
    pub fn cancel(&mut self, handle: EventHandle) -> Result<(), ScheduleError> {
        match self.queue.remove(&handle) {
            Some(_) => {
                trace!(seq = handle.seq, "event cancelled");
                Ok(())
            }
            None => Err(ScheduleError::NotFound { handle }),
        }
    }

    /// Drop every pending event without running it.  Returns how many were
    /// dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Run events in order until the queue is empty, sleeping until each one
    /// is due.
    ///
    /// # Errors
    /// Returns the first action error.  The loop stops there; events not yet
    /// run stay queued.
    pub fn run(&mut self) -> Result<(), E> {
        while let Some(&next) = self.queue.keys().next() {
            let now = Instant::now();
            if next.due > now {
                std::thread::sleep(next.due - now);
            }
            self.fire(next)?;
        }
        Ok(())
    }

    /// Like [`run`](Self::run), but waits for each event on `control` instead
    /// of sleeping, and returns as soon as a control message arrives.
    ///
    /// The channel is polled before every event, including overdue ones, so a
    /// request that arrives while an action is running is seen before the
    /// next action starts.
    ///
    /// # Errors
    /// Returns the first action error, as for [`run`](Self::run).
    pub fn run_interruptible<C>(&mut self, control: &Receiver<C>) -> Result<RunOutcome<C>, E> {
        while let Some(&next) = self.queue.keys().next() {
            match control.recv_deadline(next.due) {
                Ok(msg) => {
                    debug!(pending = self.queue.len(), "run loop interrupted by control message");
                    return Ok(RunOutcome::Interrupted(msg));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // No one can interrupt any more; fall back to plain sleeping.
                    let now = Instant::now();
                    if next.due > now {
                        std::thread::sleep(next.due - now);
                    }
                }
            }
            self.fire(next)?;
        }
        Ok(RunOutcome::Drained)
    }

    fn fire(&mut self, handle: EventHandle) -> Result<(), E> {
        match self.queue.remove(&handle) {
            Some(action) => {
                trace!(seq = handle.seq, priority = handle.priority, "event firing");
                action()
            }
            None => Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
