use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

enum State<T> {
    Pending,
    Ready(T),
    Abandoned,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Producer half of a one-shot result channel. Dropping it without sending
/// resolves the future to `Error::Abort`, so an abandoned job never leaves a
/// caller blocked.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    fulfilled: bool,
}

/// Consumer half: blocks until the job delivers its result.
pub struct QueryFuture<T> {
    shared: Arc<Shared<T>>,
}

pub fn promise<T>() -> (Promise<T>, QueryFuture<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
            fulfilled: false,
        },
        QueryFuture { shared },
    )
}

impl<T> Promise<T> {
    pub fn fulfill(mut self, value: T) {
        let mut state = self.shared.state.lock();
        *state = State::Ready(value);
        self.fulfilled = true;
        self.shared.ready.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.fulfilled {
            let mut state = self.shared.state.lock();
            if matches!(*state, State::Pending) {
                *state = State::Abandoned;
                self.shared.ready.notify_all();
            }
        }
    }
}

impl<T> QueryFuture<T> {
    /// Block until the result is available.
    pub fn wait(self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            match std::mem::replace(&mut *state, State::Pending) {
                State::Ready(value) => return Ok(value),
                State::Abandoned => return Err(Error::Abort),
                State::Pending => self.shared.ready.wait(&mut state),
            }
        }
    }

    /// Whether the result is already available (or abandoned).
    pub fn is_ready(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending)
    }
}
