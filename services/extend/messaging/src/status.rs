//! In-flight request handles.
//!
//! A [`Status`] starts open and closes exactly once, either resolved with a
//! [`Response`] or cancelled with an error. The first closer wins; later
//! attempts are silent no-ops. Waiting past a deadline reports a timeout but
//! leaves the status open so a late response can still resolve it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::error::ExtendError;
use crate::message::{Request, Response};

#[derive(Debug)]
enum State {
    Open,
    Resolved(Arc<Response>),
    Cancelled(ExtendError),
}

/// Result of waiting on a [`Status`]
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The response arrived
    Resolved(Arc<Response>),
    /// The request was cancelled
    Cancelled(ExtendError),
    /// The wait ended before either happened
    TimedOut,
}

/// Handle to one asynchronous request/response exchange
#[derive(Debug)]
pub struct Status {
    channel: Weak<Channel>,
    request: Arc<dyn Request>,
    default_timeout: Option<Duration>,
    created_at: Instant,
    state: Mutex<State>,
    cond: Condvar,
}

impl Status {
    pub(crate) fn new(
        channel: Weak<Channel>,
        request: Arc<dyn Request>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            channel,
            request,
            default_timeout,
            created_at: Instant::now(),
            state: Mutex::new(State::Open),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The request this status tracks
    pub fn request(&self) -> &Arc<dyn Request> {
        &self.request
    }

    /// Owning channel, while it is alive
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    /// Timeout used when the caller does not give one; `None` is infinite
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// When the status was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the status has been resolved or cancelled
    pub fn is_closed(&self) -> bool {
        !matches!(*self.lock(), State::Open)
    }

    /// The response once resolved; the carried error once cancelled
    pub fn response(&self) -> Result<Option<Arc<Response>>, ExtendError> {
        match &*self.lock() {
            State::Open => Ok(None),
            State::Resolved(response) => Ok(Some(response.clone())),
            State::Cancelled(e) => Err(e.clone()),
        }
    }

    /// The terminal error, if cancelled
    pub fn error(&self) -> Option<ExtendError> {
        match &*self.lock() {
            State::Cancelled(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Resolve with `response`. Returns `false` if already closed.
    pub fn set_response(&self, response: Arc<Response>) -> bool {
        self.close(State::Resolved(response))
    }

    /// Cancel with `cause`, or a generic cancellation when `None`.
    /// Returns `false` if already closed.
    pub fn cancel(&self, cause: Option<ExtendError>) -> bool {
        self.close(State::Cancelled(cause.unwrap_or_else(ExtendError::cancelled)))
    }

    fn close(&self, terminal: State) -> bool {
        {
            let mut state = self.lock();
            if !matches!(*state, State::Open) {
                return false;
            }
            *state = terminal;
        }
        self.cond.notify_all();

        if let Some(channel) = self.channel.upgrade() {
            channel.unregister_request(self.request.id());
        }
        true
    }

    /// Block until the status closes or `timeout` elapses (`None` waits
    /// forever)
    pub fn wait(&self, timeout: Option<Duration>) -> Outcome {
        let until = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.lock();
        loop {
            match &*state {
                State::Resolved(response) => return Outcome::Resolved(response.clone()),
                State::Cancelled(e) => return Outcome::Cancelled(e.clone()),
                State::Open => {}
            }
            state = match until {
                None => self.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(until) => {
                    let now = Instant::now();
                    if now >= until {
                        return Outcome::TimedOut;
                    }
                    self.cond
                        .wait_timeout(state, until - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Wait for the response, turning cancellation and timeout into errors
    pub fn wait_for_response(&self, timeout: Option<Duration>) -> Result<Arc<Response>, ExtendError> {
        match self.wait(timeout) {
            Outcome::Resolved(response) => Ok(response),
            Outcome::Cancelled(e) => Err(e),
            Outcome::TimedOut => Err(ExtendError::RequestTimeout(timeout.unwrap_or_default())),
        }
    }
}
