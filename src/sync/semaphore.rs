//! Counting semaphore with FIFO handoff, expressed as effects.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::executor;
use crate::node::Node;
use crate::runtime::run_loop;

type Grant = Box<dyn FnOnce() + Send>;

/// Counting semaphore. Waiting acquirers suspend their interpretation rather
/// than parking a thread; permits are handed off in request order.
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl Clone for Semaphore {
    fn clone(&self) -> Self {
        Semaphore {
            inner: self.inner.clone(),
        }
    }
}

struct Inner {
    state: Mutex<SemState>,
}

struct SemState {
    permits: usize,
    waiters: VecDeque<SemWaiter>,
    next_id: u64,
}

struct SemWaiter {
    id: u64,
    grant: Grant,
}

/// Lifecycle of one permit request inside [`Semaphore::with_permit`].
enum Stage {
    /// Queued (or about to be); the id arrives once known.
    Waiting(Option<u64>),
    /// Holding the permit, body running.
    Granted,
    /// Settled: released, recycled, or cancelled before the grant.
    Finished,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            inner: Arc::new(Inner {
                state: Mutex::new(SemState {
                    permits,
                    waiters: VecDeque::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    pub fn available(&self) -> Effect<usize> {
        let semaphore = self.clone();
        Effect::delay(move || semaphore.inner.state.lock().permits)
    }

    /// Takes one permit, waiting in line if none is free. Cancelling a waiting
    /// acquire leaves the queue; a permit granted while cancellation raced it
    /// is recycled.
    ///
    /// A permit taken this way must be handed back with [`Semaphore::release`];
    /// prefer [`Semaphore::with_permit`], which also releases on failure and
    /// cancellation.
    pub fn acquire(&self) -> Effect<()> {
        let semaphore = self.clone();
        Effect::cancellable(move |cb| {
            match semaphore.claim_or_enqueue(Box::new(move || cb.succeed(()))) {
                None => Effect::unit(),
                Some(id) => {
                    let semaphore = semaphore.clone();
                    Effect::delay(move || {
                        if !semaphore.remove_waiter(id) {
                            // granted while cancellation raced it
                            semaphore.release_now();
                        }
                    })
                }
            }
        })
    }

    /// Returns one permit, waking the eldest waiter if any.
    pub fn release(&self) -> Effect<()> {
        let semaphore = self.clone();
        Effect::delay(move || semaphore.release_now())
    }

    /// Runs `effect` while holding one permit. The permit is returned exactly
    /// once: on completion, on failure, or on cancellation at any point,
    /// including while still waiting in line.
    pub fn with_permit<B: Send + 'static>(&self, effect: Effect<B>) -> Effect<B> {
        let semaphore = self.clone();
        Effect::from_node(Node::Async {
            trampoline_after: true,
            producer: Box::new(move |token, _context, callback| {
                let stage = Arc::new(Mutex::new(Stage::Waiting(None)));

                // the cancellation finalizer exists before the permit is
                // requested, so no grant can slip through unreleased
                let fin_semaphore = semaphore.clone();
                let fin_stage = stage.clone();
                let finalizer = Effect::delay(move || {
                    let previous = mem::replace(&mut *fin_stage.lock(), Stage::Finished);
                    match previous {
                        Stage::Waiting(Some(id)) => {
                            // false means a grant is in flight; it recycles the
                            // permit itself when it observes the settled stage
                            let _ = fin_semaphore.remove_waiter(id);
                        }
                        Stage::Waiting(None) => {}
                        Stage::Granted => fin_semaphore.release_now(),
                        Stage::Finished => {}
                    }
                });
                if token.try_push(finalizer.node).is_err() {
                    // scope already cancelled, never request the permit
                    return;
                }

                let grant_stage = stage.clone();
                let grant_semaphore = semaphore.clone();
                let grant_token = token.clone();
                let grant: Grant = Box::new(move || {
                    {
                        let mut stage = grant_stage.lock();
                        match &*stage {
                            Stage::Finished => {
                                // cancelled while the grant was in flight
                                drop(stage);
                                grant_semaphore.release_now();
                                return;
                            }
                            _ => *stage = Stage::Granted,
                        }
                    }

                    let settle_stage = grant_stage;
                    let settle_semaphore = grant_semaphore;
                    let settle_token = grant_token.clone();
                    executor::trampoline(move || {
                        run_loop::start(
                            effect.node,
                            grant_token,
                            Box::new(move |outcome| {
                                let previous =
                                    mem::replace(&mut *settle_stage.lock(), Stage::Finished);
                                if matches!(previous, Stage::Granted) {
                                    drop(settle_token.pop());
                                    settle_semaphore.release_now();
                                    callback.invoke(outcome);
                                }
                                // Finished: cancellation already recycled the permit
                            }),
                        );
                    });
                });

                if let Some(id) = semaphore.claim_or_enqueue(grant) {
                    if let Stage::Waiting(slot) = &mut *stage.lock() {
                        *slot = Some(id);
                    }
                }
            }),
        })
    }

    /// Takes a free permit and runs the grant, or queues it. Returns the
    /// queue id when parked.
    fn claim_or_enqueue(&self, grant: Grant) -> Option<u64> {
        let mut state = self.inner.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            drop(state);
            grant();
            None
        } else {
            let id = state.next_id;
            state.next_id += 1;
            state.waiters.push_back(SemWaiter { id, grant });
            Some(id)
        }
    }

    fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.inner.state.lock();
        match state.waiters.iter().position(|waiter| waiter.id == id) {
            Some(position) => {
                state.waiters.remove(position);
                true
            }
            None => false,
        }
    }

    fn release_now(&self) {
        let grant = {
            let mut state = self.inner.state.lock();
            match state.waiters.pop_front() {
                Some(waiter) => waiter.grant,
                None => {
                    state.permits += 1;
                    return;
                }
            }
        };
        // hand off through the pool so a slow resumption cannot block the releaser
        executor::global().submit(Box::new(grant));
    }
}
