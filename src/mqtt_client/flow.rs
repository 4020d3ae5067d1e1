// SPDX-License-Identifier: MPL-2.0

use std::sync::atomic::{AtomicU8, Ordering};

use super::event_loop::EventLoopLease;

const STATE_INIT: u8 = 0;
const STATE_NOT_DONE: u8 = 1;
const STATE_DONE: u8 = 2;
const STATE_CANCELLED: u8 = 3;

/// Lifecycle of a flow bound to an execution context.
///
/// `INIT -> NOT_DONE -> DONE | CANCELLED`, or `INIT -> CANCELLED` when the flow
/// is cancelled before it is first used. Completion and cancellation may race
/// from different threads; the atomic transition decides which one wins and the
/// lease is released exactly once either way.
#[derive(Debug)]
pub struct FlowLifecycle {
    state: AtomicU8,
    lease: EventLoopLease,
}

impl FlowLifecycle {
    pub fn new(lease: EventLoopLease) -> Self {
        Self {
            state: AtomicU8::new(STATE_INIT),
            lease,
        }
    }

    /// `INIT -> NOT_DONE`. Returns `false` if the flow must not proceed, which
    /// is the case once it was cancelled (the lease is released then).
    pub fn init(&self) -> bool {
        match self.state.compare_exchange(
            STATE_INIT,
            STATE_NOT_DONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(STATE_CANCELLED) => {
                self.lease.release();
                false
            }
            Err(_) => false,
        }
    }

    /// `NOT_DONE -> DONE`. Returns whether this call performed the transition.
    pub fn mark_done(&self) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_NOT_DONE,
                STATE_DONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.lease.release();
            return true;
        }
        false
    }

    /// Moves to `CANCELLED` unless already `DONE` or `CANCELLED`.
    ///
    /// `on_cancel` runs, and the lease is released, only when the flow was
    /// `NOT_DONE`.
    pub fn cancel(&self, on_cancel: impl FnOnce()) {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                STATE_INIT | STATE_NOT_DONE => Some(STATE_CANCELLED),
                _ => None,
            });
        if previous == Ok(STATE_NOT_DONE) {
            on_cancel();
            self.lease.release();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DONE
    }

    pub fn is_disposed(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            STATE_DONE | STATE_CANCELLED
        )
    }
}
