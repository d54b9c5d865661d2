//! Single-assignment cell with waiting readers.
//!
//! A [`Deferred`] starts unset and can be completed exactly once. Readers
//! block semantically: `get` suspends the interpretation until the value
//! arrives, without parking a thread. Completion dispatches waiters through
//! the shared pool, so a slow reader cannot block the completer, and
//! completion order does not imply callback order.
//!
//! # Examples
//!
//! ```
//! use latent::runtime;
//! use latent::sync::deferred::Deferred;
//!
//! let cell = Deferred::new();
//! let reader = cell.clone();
//!
//! let program = cell.complete(42).flat_map(move |_| reader.get());
//!
//! assert_eq!(runtime::block_on(program), Ok(42));
//! ```

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::executor;
use crate::Error;

type Waiter<A> = Box<dyn FnOnce(A) + Send>;

/// Single-assignment cell; hands out clones of the completion value.
pub struct Deferred<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Deferred<A> {
    fn clone(&self) -> Self {
        Deferred {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<A> {
    /// When false, `get` registrations cannot be removed; readers must never
    /// miss completion even if their scope is cancelled.
    cancellable_reads: bool,
    state: Mutex<State<A>>,
}

enum State<A> {
    Unset {
        waiters: HashMap<u64, Waiter<A>>,
        next_id: u64,
    },
    Set(A),
}

impl<A> State<A> {
    fn empty() -> Self {
        State::Unset {
            waiters: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<A: Clone + Send + 'static> Deferred<A> {
    pub fn new() -> Self {
        Self::with_reads(true)
    }

    /// Variant whose readers cannot unregister.
    pub fn uncancellable() -> Self {
        Self::with_reads(false)
    }

    fn with_reads(cancellable_reads: bool) -> Self {
        Deferred {
            inner: Arc::new(Inner {
                cancellable_reads,
                state: Mutex::new(State::empty()),
            }),
        }
    }

    /// Waits for the value. Already-set cells complete immediately; otherwise
    /// the reader is registered and, for the default variant, removed again if
    /// its scope is cancelled while waiting.
    pub fn get(&self) -> Effect<A> {
        let cell = self.clone();
        if self.inner.cancellable_reads {
            Effect::cancellable(move |cb| match cell.register(move |value| cb.succeed(value)) {
                None => Effect::unit(),
                Some(id) => {
                    let cell = cell.clone();
                    // removal is idempotent; a completed cell ignores it
                    Effect::delay(move || cell.forget(id))
                }
            })
        } else {
            Effect::async_(move |cb| {
                let _ = cell.register(move |value| cb.succeed(value));
            })
        }
    }

    /// Single read: the value if set, without waiting.
    pub fn try_get(&self) -> Effect<Option<A>> {
        let cell = self.clone();
        Effect::delay(move || cell.peek())
    }

    /// Sets the value and wakes every waiter. Fails with an illegal-state
    /// error if the cell was already completed.
    pub fn complete(&self, value: A) -> Effect<()> {
        let cell = self.clone();
        Effect::suspend(move || {
            if cell.fulfil(value) {
                Effect::unit()
            } else {
                Effect::raise_error(Error::illegal_state("deferred already completed"))
            }
        })
    }

    /// Completion used by runtime internals; reports whether this call won.
    pub(crate) fn fulfil(&self, value: A) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Set(_) => return false,
                State::Unset { waiters, .. } => {
                    let claimed = mem::take(waiters);
                    *state = State::Set(value.clone());
                    claimed
                }
            }
        };

        // completion happens-before every waiter's callback
        for (_id, waiter) in waiters {
            let value = value.clone();
            executor::global().submit(Box::new(move || waiter(value)));
        }
        true
    }

    /// Registers a waiter, or fires it inline when the value is already set.
    /// Returns the registration id when the waiter was parked.
    fn register(&self, waiter: impl FnOnce(A) + Send + 'static) -> Option<u64> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Set(value) => {
                let value = value.clone();
                drop(state);
                waiter(value);
                None
            }
            State::Unset { waiters, next_id } => {
                let id = *next_id;
                *next_id += 1;
                waiters.insert(id, Box::new(waiter));
                Some(id)
            }
        }
    }

    fn forget(&self, id: u64) {
        if let State::Unset { waiters, .. } = &mut *self.inner.state.lock() {
            waiters.remove(&id);
        }
    }

    fn peek(&self) -> Option<A> {
        match &*self.inner.state.lock() {
            State::Set(value) => Some(value.clone()),
            State::Unset { .. } => None,
        }
    }
}

impl<A: Clone + Send + 'static> Default for Deferred<A> {
    fn default() -> Self {
        Self::new()
    }
}
