/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Errors raised by the timed event scheduler itself.
//!
//! Action failures are not wrapped here: they keep the caller's own error
//! type and surface unchanged from [`Scheduler::run`](super::Scheduler::run).

use thiserror::Error;

use super::EventHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The event already fired, was already cancelled, or never belonged to
    /// this scheduler.
    ///
    /// Expected when an early stop races the run loop; callers treat it as a
    /// no-op.
    #[error("event {handle:?} is not pending (already fired or unknown)")]
    NotFound { handle: EventHandle },
}
