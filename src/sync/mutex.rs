//! FIFO-fair asynchronous mutual exclusion
//!
//! The cart is read-modify-written from multiple UI triggers that can
//! interleave; without serialization two concurrent "add 1" calls can
//! both read quantity N and both write N+1. [`FairMutex`] hands the lock
//! to waiters strictly in arrival order, and the guard releases on drop
//! so a failing critical section can never deadlock the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<FairMutexGuard>>,
}

/// A single-slot lock with a FIFO waiter queue
///
/// Clones share the same lock; exactly one [`FairMutexGuard`] is live at
/// any instant.
#[derive(Clone)]
pub struct FairMutex {
    state: Arc<Mutex<LockState>>,
}

impl FairMutex {
    /// Create a new unlocked mutex
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire the lock, waiting behind earlier callers
    ///
    /// Returns a guard that releases on drop. Waiters are served in
    /// strict arrival order.
    pub async fn acquire(&self) -> FairMutexGuard {
        let rx = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                // A poisoned waiter list only happens if a previous
                // holder panicked inside this module's own short
                // critical sections, which never run user code.
                Err(poisoned) => poisoned.into_inner(),
            };
            if !state.locked {
                state.locked = true;
                return FairMutexGuard {
                    state: self.state.clone(),
                    released: false,
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match rx.await {
            Ok(guard) => guard,
            // The lock state was dropped while we waited; construct a
            // free-standing guard over the same (now unreachable) state
            // so callers still make progress during teardown.
            Err(_) => FairMutexGuard {
                state: self.state.clone(),
                released: false,
            },
        }
    }

    /// Number of callers currently waiting for the lock
    pub fn waiters(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }
}

impl Default for FairMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on a [`FairMutex`]; releases on drop
pub struct FairMutexGuard {
    state: Arc<Mutex<LockState>>,
    released: bool,
}

impl FairMutexGuard {
    /// Release the lock explicitly
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Hand ownership to the next live waiter. A waiter whose acquire
        // future was dropped has a dead receiver: the guard we send it
        // bounces back (or is dropped by the channel) and we move on.
        loop {
            match state.waiters.pop_front() {
                Some(tx) => {
                    let next = FairMutexGuard {
                        state: self.state.clone(),
                        released: false,
                    };
                    match tx.send(next) {
                        Ok(()) => return,
                        Err(mut bounced) => {
                            // Receiver gone; neutralize the bounced guard
                            // so its drop doesn't recurse, and try the
                            // next waiter.
                            bounced.released = true;
                        }
                    }
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }
}

impl Drop for FairMutexGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}
