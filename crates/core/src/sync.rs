// SPDX-License-Identifier: Apache-2.0

//! Wait primitives for the core's suspension points.
//!
//! [`Completion`] is a counting completion: each [`notify_one`] stores one
//! wakeup that a future [`wait`] consumes, so a notification sent before
//! anyone waits is not lost. [`notify_all_sticky`] switches the completion
//! into a permanently signalled state in which every present and future
//! wait returns immediately; [`reset`] returns it to normal operation.
//!
//! [`Interruptor`] is a cancellation token. Every wait takes one, and
//! [`interrupt`] makes each wait in progress or started later through that
//! token return [`Interrupted`]. A blocked wait registers its completion
//! with the token for the duration of the wait, so interruption reaches it
//! no matter which completion it is parked on.
//!
//! [`notify_one`]: Completion::notify_one
//! [`notify_all_sticky`]: Completion::notify_all_sticky
//! [`wait`]: Completion::wait
//! [`reset`]: Completion::reset
//! [`interrupt`]: Interruptor::interrupt

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::Interrupted;

#[derive(Default)]
struct WaitState {
    pending: u64,
    sticky: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WaitState>,
    condvar: Condvar,
}

/// A counting completion with broadcast support.
///
/// Clones share the same wait state, so a completion can be handed to the
/// thread that will signal it while another thread waits on it.
#[derive(Clone, Default)]
pub struct Completion {
    shared: Arc<Shared>,
}

impl Completion {
    /// Creates a completion with no pending wakeups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one wakeup and wakes the waiter that has been blocked the
    /// longest, if any.
    pub fn notify_one(&self) {
        let mut state = self.shared.state.lock();
        state.pending += 1;
        drop(state);
        let _ = self.shared.condvar.notify_one();
    }

    /// Makes the completion permanently signalled and wakes every waiter.
    ///
    /// Subsequent calls to [`Completion::wait`] return immediately without
    /// consuming pending wakeups, until [`Completion::reset`] is called.
    pub fn notify_all_sticky(&self) {
        let mut state = self.shared.state.lock();
        state.sticky = true;
        drop(state);
        let _ = self.shared.condvar.notify_all();
    }

    /// Clears pending wakeups and the sticky signalled state.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.pending = 0;
        state.sticky = false;
    }

    /// Blocks until a wakeup is available, the completion is permanently
    /// signalled, or `interruptor` fires.
    pub fn wait(&self, interruptor: &Interruptor) -> Result<(), Interrupted> {
        interruptor.register(&self.shared);
        let result = self.wait_registered(interruptor);
        interruptor.deregister(&self.shared);
        result
    }

    fn wait_registered(&self, interruptor: &Interruptor) -> Result<(), Interrupted> {
        let mut state = self.shared.state.lock();

        loop {
            if interruptor.is_interrupted() {
                return Err(Interrupted);
            }

            if state.sticky {
                return Ok(());
            }

            if state.pending > 0 {
                state.pending -= 1;
                return Ok(());
            }

            self.shared.condvar.wait(&mut state);
        }
    }
}

#[derive(Default)]
struct InterruptorShared {
    interrupted: AtomicBool,
    /// Completions with a wait in progress through this token.
    waiting_on: Mutex<Vec<Arc<Shared>>>,
}

/// A cancellation token for [`Completion::wait`].
///
/// Clones share the same interrupted state; keep one clone on the thread
/// that may need to cancel, and pass another to the waits.
#[derive(Clone, Default)]
pub struct Interruptor {
    shared: Arc<InterruptorShared>,
}

impl Interruptor {
    /// Creates a token that has not been interrupted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every in-flight and future wait through this token return
    /// [`Interrupted`].
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::Release);

        let waiting = self.shared.waiting_on.lock();
        for completion in waiting.iter() {
            // Taking the lock orders the store against waiters that already
            // checked the flag and are about to block.
            drop(completion.state.lock());
            let _ = completion.condvar.notify_all();
        }
    }

    /// Returns whether [`Interruptor::interrupt`] has been called.
    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::Acquire)
    }

    fn register(&self, completion: &Arc<Shared>) {
        self.shared.waiting_on.lock().push(Arc::clone(completion));
    }

    fn deregister(&self, completion: &Arc<Shared>) {
        let mut waiting = self.shared.waiting_on.lock();
        if let Some(position) = waiting.iter().position(|s| Arc::ptr_eq(s, completion)) {
            let _ = waiting.swap_remove(position);
        }
    }
}
