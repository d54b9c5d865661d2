//! First-class descriptions of computations.
//!
//! An [`Effect`] is a value describing a computation; building one performs no
//! side effect. Effects are interpreted by the entry points in
//! [`crate::runtime`]. Sequencing, error handling, resource safety, and
//! forking are all expressed as combinators returning new descriptions.
//!
//! Effects are one-shot values: interpretation consumes the description, so a
//! computation that should run twice is described twice.
//!
//! # Examples
//!
//! ```
//! use latent::effect::Effect;
//! use latent::runtime;
//!
//! let program = Effect::delay(|| 6).flat_map(|n| Effect::pure(n * 7));
//!
//! assert_eq!(runtime::run_sync(program), Ok(42));
//! ```

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor;
use crate::fiber::{self, Fiber};
use crate::node::{boxed, catching, unboxed, Chain, Frame, Node, Outcome};
use crate::runtime::run_loop;
use crate::runtime::token::CancelToken;
use crate::Error;

/// A lazily built, first-class description of a computation producing `A`.
pub struct Effect<A> {
    pub(crate) node: Node,
    marker: PhantomData<fn() -> A>,
}

/// How a bracketed region finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCase {
    Completed,
    Errored(Error),
    Canceled,
}

/// Completion handle passed to asynchronous producers.
///
/// At most one invocation is honoured. Later invocations are dropped, with a
/// diagnostic line on the error stream when the dropped result was an error.
pub struct Callback<A> {
    deliver: Arc<dyn Fn(Outcome) + Send + Sync>,
    marker: PhantomData<fn(A)>,
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        Callback {
            deliver: self.deliver.clone(),
            marker: PhantomData,
        }
    }
}

impl<A: Send + 'static> Callback<A> {
    pub(crate) fn new(deliver: impl Fn(Outcome) + Send + Sync + 'static) -> Self {
        Callback {
            deliver: Arc::new(deliver),
            marker: PhantomData,
        }
    }

    pub fn complete(&self, result: Result<A, Error>) {
        (self.deliver)(result.map(boxed));
    }

    pub fn succeed(&self, value: A) {
        self.complete(Ok(value));
    }

    pub fn fail(&self, error: Error) {
        self.complete(Err(error));
    }
}

/// Lifecycle of a producer's cancellation action.
enum Registration {
    Pending,
    Registered,
    Done,
}

impl<A: Send + 'static> Effect<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Effect {
            node,
            marker: PhantomData,
        }
    }

    /// An already-evaluated value.
    pub fn pure(value: A) -> Self {
        Self::from_node(Node::Pure(boxed(value)))
    }

    /// Evaluates `thunk` when interpreted; a panic becomes an error.
    pub fn delay(thunk: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_node(Node::Delay(Box::new(move || boxed(thunk()))))
    }

    /// Defers construction of the effect itself; enables recursion.
    pub fn suspend(thunk: impl FnOnce() -> Effect<A> + Send + 'static) -> Self {
        Self::from_node(Node::Suspend(Box::new(move || thunk().node)))
    }

    /// Unconditional failure.
    pub fn raise_error(error: Error) -> Self {
        Self::from_node(Node::RaiseError(error))
    }

    pub fn from_result(result: Result<A, Error>) -> Self {
        match result {
            Ok(value) => Self::pure(value),
            Err(error) => Self::raise_error(error),
        }
    }

    /// Suspends at an asynchronous boundary.
    ///
    /// `producer` must arrange for the callback to be invoked exactly once,
    /// from any thread. It runs when the interpreter reaches the boundary.
    pub fn async_(producer: impl FnOnce(Callback<A>) + Send + 'static) -> Self {
        Self::from_node(Node::Async {
            trampoline_after: true,
            producer: Box::new(move |_token, _context, callback| {
                producer(Callback::new(move |outcome| callback.invoke(outcome)));
            }),
        })
    }

    /// Like [`Effect::async_`], with a cancellation action: the effect the
    /// producer returns runs if the surrounding scope is cancelled while the
    /// callback is still pending. The action must be idempotent.
    pub fn cancellable(producer: impl FnOnce(Callback<A>) -> Effect<()> + Send + 'static) -> Self {
        Self::from_node(Node::Async {
            trampoline_after: true,
            producer: Box::new(move |token, _context, callback| {
                let registration = Arc::new(Mutex::new(Registration::Pending));

                let state = registration.clone();
                let owner = token.clone();
                let resume = callback.clone();
                let user_callback = Callback::new(move |outcome| {
                    let previous = mem::replace(&mut *state.lock(), Registration::Done);
                    if let Registration::Registered = previous {
                        // the boundary is settled, the cancel action is stale
                        drop(owner.pop());
                    }
                    resume.invoke(outcome);
                });

                match catching(move || producer(user_callback)) {
                    Err(error) => callback.invoke(Err(error)),
                    Ok(cancel_action) => {
                        let mut state = registration.lock();
                        match &*state {
                            Registration::Done => drop(cancel_action),
                            _ => match token.try_push(cancel_action.node) {
                                Ok(()) => *state = Registration::Registered,
                                Err(action) => {
                                    // the scope is already cancelled
                                    drop(state);
                                    settle_quietly(action, "cancellation action failed");
                                }
                            },
                        }
                    }
                }
            }),
        })
    }

    pub fn map<B: Send + 'static>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B> {
        Effect::from_node(Node::Bind(
            Chain::new(self.node),
            Frame::Map(Box::new(move |value| boxed(f(unboxed::<A>(value))))),
        ))
    }

    pub fn flat_map<B: Send + 'static>(self, f: impl FnOnce(A) -> Effect<B> + Send + 'static) -> Effect<B> {
        Effect::from_node(Node::Bind(
            Chain::new(self.node),
            Frame::Bind(Box::new(move |value| f(unboxed::<A>(value)).node)),
        ))
    }

    pub fn void(self) -> Effect<()> {
        self.map(|_| ())
    }

    /// Materializes the outcome, so failure becomes an ordinary value.
    pub fn attempt(self) -> Effect<Result<A, Error>> {
        Effect::from_node(Node::Bind(
            Chain::new(self.node),
            Frame::Handler {
                on_value: Some(Box::new(|value| {
                    Node::Pure(boxed(Ok::<A, Error>(unboxed::<A>(value))))
                })),
                on_error: Box::new(|error| Node::Pure(boxed(Err::<A, Error>(error)))),
            },
        ))
    }

    /// Recovers from failure with a new effect; values pass through untouched.
    pub fn handle_error_with(self, f: impl FnOnce(Error) -> Effect<A> + Send + 'static) -> Effect<A> {
        Effect::from_node(Node::Bind(
            Chain::new(self.node),
            Frame::Handler {
                on_value: None,
                on_error: Box::new(move |error| f(error).node),
            },
        ))
    }

    /// Folds both outcomes into a value.
    pub fn redeem<B: Send + 'static>(
        self,
        recover: impl FnOnce(Error) -> B + Send + 'static,
        map: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B> {
        self.redeem_with(
            move |error| Effect::pure(recover(error)),
            move |value| Effect::pure(map(value)),
        )
    }

    /// Folds both outcomes into a new effect.
    pub fn redeem_with<B: Send + 'static>(
        self,
        recover: impl FnOnce(Error) -> Effect<B> + Send + 'static,
        bind: impl FnOnce(A) -> Effect<B> + Send + 'static,
    ) -> Effect<B> {
        Effect::from_node(Node::Bind(
            Chain::new(self.node),
            Frame::Handler {
                on_value: Some(Box::new(move |value| bind(unboxed::<A>(value)).node)),
                on_error: Box::new(move |error| recover(error).node),
            },
        ))
    }

    /// Masks cancellation for the extent of this effect. A cancel requested
    /// meanwhile is latched and observed at the next unmasked poll.
    pub fn uncancellable(self) -> Effect<A> {
        Effect::from_node(Node::ContextSwitch {
            inner: Chain::new(self.node),
            modify: Box::new(|token| {
                token.push_mask();
                token
            }),
            restore: Some(Box::new(|_outcome, _previous, current| {
                current.pop_mask();
                current
            })),
        })
    }

    /// Treats `self` as resource acquisition. Acquisition cannot be
    /// interrupted; once it succeeds, `release` runs exactly once, whether the
    /// body completes, fails, or the surrounding scope is cancelled.
    pub fn bracket<B: Send + 'static>(
        self,
        use_: impl FnOnce(A) -> Effect<B> + Send + 'static,
        release: impl Fn(A) -> Effect<()> + Send + Sync + 'static,
    ) -> Effect<B>
    where
        A: Clone,
    {
        self.bracket_case(use_, move |resource, _exit| release(resource))
    }

    /// [`Effect::bracket`] with the exit case handed to `release`.
    pub fn bracket_case<B: Send + 'static>(
        self,
        use_: impl FnOnce(A) -> Effect<B> + Send + 'static,
        release: impl Fn(A, ExitCase) -> Effect<()> + Send + Sync + 'static,
    ) -> Effect<B>
    where
        A: Clone,
    {
        let acquire = self.node;
        Effect::from_node(Node::Async {
            trampoline_after: true,
            producer: Box::new(move |token, _context, callback| {
                let release = Arc::new(release);
                executor::trampoline(move || {
                    run_loop::start(
                        acquire,
                        CancelToken::uncancellable(),
                        Box::new(move |acquired| {
                            let resource = match acquired {
                                Err(error) => return callback.invoke(Err(error)),
                                Ok(value) => unboxed::<A>(value),
                            };

                            // whichever path reaches the guard first owns the release
                            let released = Arc::new(AtomicBool::new(false));

                            let guard = released.clone();
                            let for_cancel = resource.clone();
                            let on_cancel = release.clone();
                            let finalizer = Effect::suspend(move || {
                                if guard.swap(true, Ordering::AcqRel) {
                                    Effect::unit()
                                } else {
                                    (*on_cancel)(for_cancel, ExitCase::Canceled)
                                }
                            });

                            if let Err(finalizer) = token.try_push(finalizer.node) {
                                // already cancelled: release and vanish, the
                                // terminal callback must not fire
                                drop(finalizer);
                                settle_quietly(
                                    (*release)(resource, ExitCase::Canceled).node,
                                    "release after cancellation failed",
                                );
                                return;
                            }

                            // the settling step is masked so a cancellation
                            // poll cannot separate the pop from the release
                            let for_use = resource.clone();
                            let settle_token = token.clone();
                            let body = Effect::suspend(move || use_(for_use)).attempt().flat_map(
                                move |outcome| {
                                    Effect::suspend(move || {
                                        drop(settle_token.pop());
                                        let case = match &outcome {
                                            Ok(_) => ExitCase::Completed,
                                            Err(error) => ExitCase::Errored(error.clone()),
                                        };
                                        let settle = if released.swap(true, Ordering::AcqRel) {
                                            Effect::unit()
                                        } else {
                                            (*release)(resource, case)
                                        };
                                        settle.flat_map(move |_| Effect::from_result(outcome))
                                    })
                                    .uncancellable()
                                },
                            );

                            executor::trampoline(move || {
                                run_loop::start(
                                    body.node,
                                    token,
                                    Box::new(move |outcome| callback.invoke(outcome)),
                                );
                            });
                        }),
                    );
                });
            }),
        })
    }

    /// Runs `finalizer` after this effect, on completion, failure, or
    /// cancellation.
    pub fn guarantee(self, finalizer: Effect<()>) -> Effect<A> {
        let finalizer = Mutex::new(Some(finalizer));
        self.guarantee_case(move |_exit| finalizer.lock().take().unwrap_or_else(Effect::unit))
    }

    /// [`Effect::guarantee`] with the exit case handed to the finalizer.
    pub fn guarantee_case(
        self,
        finalizer: impl Fn(ExitCase) -> Effect<()> + Send + Sync + 'static,
    ) -> Effect<A> {
        Effect::unit().bracket_case(move |_| self, move |_, exit| finalizer(exit))
    }

    /// Forks this effect onto the shared pool under its own cancellation
    /// scope.
    pub fn start(self) -> Effect<Fiber<A>>
    where
        A: Clone,
    {
        fiber::start(self)
    }
}

impl Effect<()> {
    pub fn unit() -> Effect<()> {
        Effect::pure(())
    }

    /// Hops the continuation onto the shared pool, yielding the current thread.
    pub fn shift() -> Effect<()> {
        Effect::from_node(Node::Async {
            // the callback always fires on a fresh worker stack
            trampoline_after: false,
            producer: Box::new(|_token, _context, callback| {
                executor::global().submit(Box::new(move || callback.invoke(Ok(boxed(())))));
            }),
        })
    }
}

/// Runs a settling node outside any interpretation, reporting failures to the
/// diagnostic stream.
fn settle_quietly(node: Node, context: &'static str) {
    executor::trampoline(move || {
        run_loop::start(
            node,
            CancelToken::uncancellable(),
            Box::new(move |outcome| {
                if let Err(error) = outcome {
                    crate::report_failure(context, &error);
                }
            }),
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{block_on, run_cancellable, run_sync};
    use std::time::Duration;

    mod laws {
        use super::*;

        #[test]
        fn pure_bind_is_application() {
            let f = |n: i32| Effect::pure(n + 1);

            assert_eq!(run_sync(Effect::pure(1).flat_map(f)), run_sync(f(1)));
        }

        #[test]
        fn bind_pure_is_identity() {
            let m = || Effect::delay(|| 5);

            assert_eq!(run_sync(m().flat_map(Effect::pure)), run_sync(m()));
        }

        #[test]
        fn bind_associates() {
            let m = || Effect::delay(|| 2);
            let f = |n: i32| Effect::pure(n * 10);
            let g = |n: i32| Effect::pure(n + 1);

            let left = m().flat_map(f).flat_map(g);
            let right = m().flat_map(move |n| f(n).flat_map(g));

            assert_eq!(run_sync(left), run_sync(right));
        }

        #[test]
        fn raised_error_reaches_its_handler() {
            let effect = Effect::<i32>::raise_error(Error::raised("nope"))
                .handle_error_with(|error| Effect::pure(error.to_string().len() as i32));

            assert_eq!(run_sync(effect), Ok(4));
        }

        #[test]
        fn handler_leaves_values_untouched() {
            let effect = Effect::pure(1).handle_error_with(|_| Effect::pure(2));

            assert_eq!(run_sync(effect), Ok(1));
        }
    }

    mod stack_safety {
        use super::*;

        const DEPTH: usize = 100_000;

        #[test]
        fn left_nested_binds() {
            let mut effect = Effect::pure(0);
            for _ in 0..DEPTH {
                effect = effect.flat_map(|n| Effect::pure(n + 1));
            }

            assert_eq!(run_sync(effect), Ok(DEPTH));
        }

        #[test]
        fn left_nested_maps() {
            let mut effect = Effect::pure(0usize);
            for _ in 0..DEPTH {
                effect = effect.map(|n| n + 1);
            }

            assert_eq!(run_sync(effect), Ok(DEPTH));
        }

        #[test]
        fn left_nested_attempts() {
            let mut effect = Effect::pure(0usize);
            for _ in 0..DEPTH {
                effect = effect.attempt().map(Result::unwrap);
            }

            assert_eq!(run_sync(effect), Ok(0));
        }

        #[test]
        fn left_nested_handlers() {
            let mut effect = Effect::pure(0usize);
            for _ in 0..DEPTH {
                effect = effect.handle_error_with(|_| Effect::pure(0));
            }

            assert_eq!(run_sync(effect), Ok(0));
        }

        #[test]
        fn attempt_flat_map_fold() {
            let mut effect = Effect::pure(0);
            for _ in 0..10_000 {
                effect = effect.attempt().flat_map(|result| match result {
                    Ok(n) => Effect::pure(n + 1),
                    Err(error) => Effect::raise_error(error),
                });
            }

            assert_eq!(run_sync(effect), Ok(10_000));
        }

        #[test]
        fn recursive_suspension() {
            fn countdown(n: u64) -> Effect<u64> {
                Effect::suspend(move || {
                    if n == 0 {
                        Effect::pure(0)
                    } else {
                        countdown(n - 1)
                    }
                })
            }

            assert_eq!(run_sync(countdown(100_000)), Ok(0));
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn delay_panic_becomes_an_error() {
            let effect = Effect::<i32>::delay(|| panic!("kaboom"));

            assert_eq!(run_sync(effect), Err(Error::Panicked("kaboom".to_string())));
        }

        #[test]
        fn attempt_materializes_failure() {
            let effect = Effect::<i32>::raise_error(Error::raised("nope")).attempt();

            assert_eq!(run_sync(effect), Ok(Err(Error::raised("nope"))));
        }

        #[test]
        fn redeem_folds_both_sides() {
            let failed = Effect::<i32>::raise_error(Error::raised("x")).redeem(|_| -1, |n| n);
            let succeeded = Effect::pure(3).redeem(|_| -1, |n| n * 2);

            assert_eq!(run_sync(failed), Ok(-1));
            assert_eq!(run_sync(succeeded), Ok(6));
        }

        #[test]
        fn panicking_recovery_reraises() {
            let effect = Effect::<i32>::raise_error(Error::raised("first"))
                .handle_error_with(|_| -> Effect<i32> { panic!("second") })
                .handle_error_with(|error| Effect::pure(error.to_string().len() as i32));

            // the outer handler sees the panic from the inner recovery
            assert_eq!(run_sync(effect), Ok("panicked: second".len() as i32));
        }

        #[test]
        fn fatal_errors_bypass_handlers() {
            let effect =
                Effect::<i32>::raise_error(Error::fatal("vm")).handle_error_with(|_| Effect::pure(0));

            assert_eq!(run_sync(effect), Err(Error::fatal("vm")));
        }
    }

    mod asynchronous {
        use super::*;
        use std::thread;

        #[test]
        fn producer_thread_delivers() {
            let effect = Effect::async_(|cb| {
                thread::spawn(move || cb.succeed(5));
            });

            assert_eq!(block_on(effect), Ok(5));
        }

        #[test]
        fn second_invocation_is_dropped() {
            let effect = Effect::async_(|cb: Callback<i32>| {
                cb.succeed(1);
                cb.succeed(2);
            });

            assert_eq!(block_on(effect), Ok(1));
        }

        #[test]
        fn synchronous_completion_chains_are_stack_safe() {
            let mut effect = Effect::pure(0usize);
            for _ in 0..10_000 {
                effect = effect.flat_map(|n| Effect::async_(move |cb| cb.succeed(n + 1)));
            }

            assert_eq!(block_on(effect), Ok(10_000));
        }
    }

    mod bracket {
        use super::*;
        use std::sync::atomic::AtomicUsize;

        #[test]
        fn releases_after_completion() {
            let releases = Arc::new(AtomicUsize::new(0));
            let counter = releases.clone();

            let effect = Effect::pure(1).bracket(
                |n| Effect::pure(n + 1),
                move |_| {
                    let counter = counter.clone();
                    Effect::delay(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                },
            );

            assert_eq!(block_on(effect), Ok(2));
            assert_eq!(releases.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn releases_after_failure_and_surfaces_it() {
            let releases = Arc::new(AtomicUsize::new(0));
            let counter = releases.clone();

            let effect = Effect::pure(1).bracket(
                |_| Effect::<i32>::raise_error(Error::raised("use failed")),
                move |_| {
                    let counter = counter.clone();
                    Effect::delay(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                },
            );

            assert_eq!(block_on(effect), Err(Error::raised("use failed")));
            assert_eq!(releases.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn skips_release_when_acquisition_fails() {
            let releases = Arc::new(AtomicUsize::new(0));
            let counter = releases.clone();

            let effect = Effect::<i32>::raise_error(Error::raised("no resource")).bracket(
                Effect::pure,
                move |_| {
                    let counter = counter.clone();
                    Effect::delay(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                },
            );

            assert_eq!(block_on(effect), Err(Error::raised("no resource")));
            assert_eq!(releases.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn release_sees_the_exit_case() {
            let observed = Arc::new(Mutex::new(Vec::new()));
            let log = observed.clone();

            let effect = Effect::pure(()).bracket_case(
                |_| Effect::<i32>::raise_error(Error::raised("x")),
                move |_, exit| {
                    let log = log.clone();
                    Effect::delay(move || log.lock().push(exit))
                },
            );

            let _ = block_on(effect);

            assert_eq!(*observed.lock(), vec![ExitCase::Errored(Error::raised("x"))]);
        }

        #[test]
        fn releases_on_cancellation() {
            let releases = Arc::new(AtomicUsize::new(0));
            let counter = releases.clone();

            let effect = Effect::pure(1).bracket(
                |_| {
                    Effect::<i32>::async_(|_cb| {
                        // never completes
                    })
                },
                move |_| {
                    let counter = counter.clone();
                    Effect::delay(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                },
            );

            let cancel = run_cancellable(effect, |_| panic!("terminal callback must not fire"));
            // give the interpretation time to reach the suspension point
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(block_on(cancel), Ok(()));

            assert_eq!(releases.load(Ordering::SeqCst), 1);
        }
    }

    mod guarantee {
        use super::*;
        use std::sync::atomic::AtomicUsize;

        #[test]
        fn runs_on_success_and_failure() {
            let runs = Arc::new(AtomicUsize::new(0));

            for outcome in [Ok(1), Err(Error::raised("x"))] {
                let counter = runs.clone();
                let effect = Effect::from_result(outcome).guarantee(Effect::delay(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
                let _ = block_on(effect);
            }

            assert_eq!(runs.load(Ordering::SeqCst), 2);
        }
    }

    mod cancellable {
        use super::*;
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        #[test]
        fn completes_normally_when_not_cancelled() {
            let effect = Effect::cancellable(|cb| {
                thread::spawn(move || cb.succeed(9));
                Effect::unit()
            });

            assert_eq!(block_on(effect), Ok(9));
        }

        #[test]
        fn cancel_action_runs_on_cancellation() {
            let cancels = Arc::new(AtomicUsize::new(0));
            let counter = cancels.clone();

            let effect = Effect::<i32>::cancellable(move |_cb| {
                let counter = counter.clone();
                Effect::delay(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            });

            let cancel = run_cancellable(effect, |_| panic!("terminal callback must not fire"));
            thread::sleep(Duration::from_millis(50));
            assert_eq!(block_on(cancel), Ok(()));

            assert_eq!(cancels.load(Ordering::SeqCst), 1);
        }
    }

    mod uncancellable {
        use super::*;
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        #[test]
        fn masked_region_runs_to_completion() {
            let steps = Arc::new(AtomicUsize::new(0));
            let counter = steps.clone();

            // cancel is requested while the masked region is still pending
            let effect = Effect::shift()
                .flat_map(move |_| {
                    Effect::delay(move || {
                        thread::sleep(Duration::from_millis(50));
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .uncancellable();

            let cancel = run_cancellable(effect, |_| {});
            thread::sleep(Duration::from_millis(10));
            assert_eq!(block_on(cancel), Ok(()));

            thread::sleep(Duration::from_millis(100));
            assert_eq!(steps.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn continuation_is_interruptible_after_the_mask() {
            let finalizers = Arc::new(AtomicUsize::new(0));
            let counter = finalizers.clone();

            // the masked region completes synchronously; the continuation
            // parks at an asynchronous boundary and must still be cancellable
            let effect = Effect::delay(|| 1).uncancellable().flat_map(move |_| {
                Effect::<i32>::async_(|_cb| {
                    // never completes
                })
                .guarantee(Effect::delay(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
            });

            let cancel = run_cancellable(effect, |_| panic!("terminal callback must not fire"));
            thread::sleep(Duration::from_millis(20));
            assert_eq!(block_on(cancel), Ok(()));

            assert_eq!(finalizers.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn latched_cancel_is_observed_after_the_mask() {
            const TAIL: usize = 50_000;
            let steps = Arc::new(AtomicUsize::new(0));

            let masked =
                Effect::delay(|| thread::sleep(Duration::from_millis(50))).uncancellable();

            let counter = steps.clone();
            let mut tail = Effect::unit();
            for _ in 0..TAIL {
                let counter = counter.clone();
                tail = tail.flat_map(move |_| {
                    Effect::delay(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                });
            }

            let effect = Effect::shift()
                .flat_map(move |_| masked)
                .flat_map(move |_| tail);

            // the cancel lands while the mask is up; once the restore frame
            // pops it, the next poll must stop the run short of the full tail
            let cancel = run_cancellable(effect, |_| panic!("cancelled run must not complete"));
            thread::sleep(Duration::from_millis(10));
            assert_eq!(block_on(cancel), Ok(()));

            thread::sleep(Duration::from_millis(200));
            assert!(steps.load(Ordering::SeqCst) < TAIL);
        }
    }

    mod traits {
        use super::*;
        use impls::impls;
        use std::fmt::Debug;

        #[test]
        fn effects_move_between_threads() {
            assert!(impls!(Effect<i32>: Send & !Clone));
        }

        #[test]
        fn callbacks_are_shared_freely() {
            assert!(impls!(Callback<i32>: Send & Sync & Clone & !Debug));
        }
    }
}
