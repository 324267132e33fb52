//! Reentrant thread gate.
//!
//! Any number of threads may hold the gate at once. A closer waits until it
//! is the only thread left inside, then holds the gate exclusively until it
//! reopens it. While a close is pending, threads not already inside are
//! refused; threads already inside may re-enter so they can finish and leave.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Default)]
struct GateState {
    active: HashMap<ThreadId, usize>,
    closer: Option<ThreadId>,
    close_count: usize,
    pending_closers: usize,
}

impl GateState {
    fn others_active(&self, me: ThreadId) -> bool {
        self.active.keys().any(|id| *id != me)
    }
}

/// Counting reentrant gate with an exclusive close mode
#[derive(Debug, Default)]
pub struct ThreadGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

impl ThreadGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait on the condition; returns `None` once `until` has passed
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, GateState>,
        until: Option<Instant>,
    ) -> Option<MutexGuard<'a, GateState>> {
        match until {
            None => Some(self.cond.wait(guard).unwrap_or_else(|e| e.into_inner())),
            Some(until) => {
                let now = Instant::now();
                if now >= until {
                    return None;
                }
                let (guard, _) = self
                    .cond
                    .wait_timeout(guard, until - now)
                    .unwrap_or_else(|e| e.into_inner());
                Some(guard)
            }
        }
    }

    /// Enter the gate, waiting up to `timeout` (`None` waits forever).
    ///
    /// Returns `false` if the gate stayed closed for the whole wait.
    pub fn enter(&self, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let until = deadline(timeout);
        let mut state = self.lock();
        loop {
            if let Some(count) = state.active.get_mut(&me) {
                *count += 1;
                return true;
            }
            let admitted = match state.closer {
                Some(closer) => closer == me,
                None => state.pending_closers == 0,
            };
            if admitted {
                state.active.insert(me, 1);
                return true;
            }
            state = match self.wait(state, until) {
                Some(state) => state,
                None => return false,
            };
        }
    }

    /// Leave the gate once for each prior [`ThreadGate::enter`]
    pub fn exit(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        match state.active.get_mut(&me) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.active.remove(&me);
                drop(state);
                self.cond.notify_all();
            }
            None => warn!("gate exit by a thread that never entered"),
        }
    }

    /// Close the gate, waiting up to `timeout` for other threads to leave.
    ///
    /// Closing is reentrant for the closing thread. Returns `false` if the
    /// gate could not be closed in time; the gate is then left as it was.
    pub fn close(&self, timeout: Option<Duration>) -> bool {
        let me = thread::current().id();
        let until = deadline(timeout);
        let mut state = self.lock();
        if state.closer == Some(me) {
            state.close_count += 1;
            return true;
        }

        state.pending_closers += 1;
        loop {
            if state.closer.is_none() && !state.others_active(me) {
                state.pending_closers -= 1;
                state.closer = Some(me);
                state.close_count = 1;
                return true;
            }
            state = match self.wait(state, until) {
                Some(state) => state,
                None => {
                    let mut state = self.lock();
                    state.pending_closers -= 1;
                    drop(state);
                    self.cond.notify_all();
                    return false;
                }
            };
        }
    }

    /// Reopen a gate closed by the current thread.
    ///
    /// Must be called once per successful [`ThreadGate::close`].
    pub fn open(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        if state.closer != Some(me) {
            warn!("gate open by a thread that does not hold it closed");
            return;
        }
        state.close_count -= 1;
        if state.close_count == 0 {
            state.closer = None;
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Whether the current thread has entered the gate
    pub fn is_active_thread(&self) -> bool {
        self.lock().active.contains_key(&thread::current().id())
    }

    /// Whether some thread holds the gate closed
    pub fn is_closed(&self) -> bool {
        self.lock().closer.is_some()
    }

    /// Whether the current thread holds the gate closed
    pub fn is_closed_by_current_thread(&self) -> bool {
        self.lock().closer == Some(thread::current().id())
    }

    /// Number of threads currently inside
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }
}
