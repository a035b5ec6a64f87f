//! Deadlock-safe once-only lazy initialization for expensive IO resources.
//!
//! The initializer may itself await KV reads that are scheduled on the same
//! executor as the callers, so the handle never holds a lock across the
//! initializer's suspension points: state transitions happen under a short
//! sync lock, the future runs outside it, and waiters park on a `Notify`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

type InitFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type InitThunk<T> = Box<dyn FnOnce() -> InitFuture<T> + Send>;

enum State<T> {
    /// Initializer not yet started.
    Pending(Option<InitThunk<T>>),
    /// One caller is driving the initializer; everyone else waits.
    Initializing,
    Ready(Arc<T>),
    /// The initializer failed once; the same error is re-raised to every
    /// caller, it is never re-run.
    Failed(Arc<Error>),
    Closed,
}

/// Once-only lazy initializer. `get()` suspends until the value is ready;
/// the initializer runs exactly once regardless of how many callers race.
pub struct LazyHandle<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Send + Sync + 'static> LazyHandle<T> {
    pub fn new<F, Fut>(init: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            state: Mutex::new(State::Pending(Some(Box::new(move || {
                Box::pin(init()) as InitFuture<T>
            })))),
            notify: Notify::new(),
        }
    }

    /// The value, if already initialized.
    pub fn try_get(&self) -> Option<Arc<T>> {
        match &*self.state.lock() {
            State::Ready(value) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    pub async fn get(&self) -> Result<Arc<T>> {
        loop {
            let thunk = {
                let mut state = self.state.lock();
                match &mut *state {
                    State::Ready(value) => return Ok(Arc::clone(value)),
                    State::Failed(err) => return Err(Error::Shared(Arc::clone(err))),
                    State::Closed => {
                        return Err(Error::AlreadyClosed("lazy handle used after close".into()))
                    }
                    State::Initializing => None,
                    State::Pending(thunk) => {
                        let thunk = thunk.take();
                        *state = State::Initializing;
                        thunk
                    }
                }
            };

            if let Some(thunk) = thunk {
                // We won the race: run the initializer with no lock held.
                let result = thunk().await;
                let outcome = {
                    let mut state = self.state.lock();
                    match result {
                        Ok(value) => {
                            let value = Arc::new(value);
                            *state = State::Ready(Arc::clone(&value));
                            Ok(value)
                        }
                        Err(err) => {
                            let err = Arc::new(err);
                            *state = State::Failed(Arc::clone(&err));
                            Err(Error::Shared(err))
                        }
                    }
                };
                self.notify.notify_waiters();
                return outcome;
            }

            // Someone else is initializing. Register for the wakeup before
            // re-checking so a completion between the check and the await is
            // not lost.
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if !matches!(&*state, State::Initializing) {
                    continue;
                }
            }
            notified.await;
        }
    }

    /// Close the handle. The close function runs only if the value was
    /// actually initialized; a never-initialized handle closes as a no-op and
    /// the initializer is not triggered. Subsequent `get()` calls fail with
    /// `AlreadyClosed`.
    pub async fn close<F, Fut>(&self, close_fn: F) -> Result<()>
    where
        F: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let value = loop {
            let waiting = {
                let mut state = self.state.lock();
                match std::mem::replace(&mut *state, State::Closed) {
                    State::Ready(value) => break Some(value),
                    State::Pending(_) | State::Failed(_) | State::Closed => break None,
                    State::Initializing => {
                        // Put the marker back and wait for the initializer.
                        *state = State::Initializing;
                        true
                    }
                }
            };
            if waiting {
                let notified = self.notify.notified();
                {
                    let state = self.state.lock();
                    if !matches!(&*state, State::Initializing) {
                        continue;
                    }
                }
                notified.await;
            }
        };
        self.notify.notify_waiters();
        match value {
            Some(value) => close_fn(value).await,
            None => Ok(()),
        }
    }
}
