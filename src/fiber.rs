//! Forked interpretations with their own cancellation scope.

use crate::effect::Effect;
use crate::executor;
use crate::node::{boxed, unboxed, Node};
use crate::runtime::run_loop;
use crate::runtime::token::CancelToken;
use crate::sync::deferred::Deferred;
use crate::Error;

/// Handle to a forked interpretation.
///
/// A fiber shares no continuation stack with its parent: it owns a fresh
/// cancellation scope and publishes its result through a single-assignment
/// cell. Handles are cheap to clone; every clone joins the same result.
pub struct Fiber<A> {
    pub(crate) token: CancelToken,
    pub(crate) result: Deferred<Result<A, Error>>,
}

impl<A> Clone for Fiber<A> {
    fn clone(&self) -> Self {
        Fiber {
            token: self.token.clone(),
            result: self.result.clone(),
        }
    }
}

impl<A: Clone + Send + 'static> Fiber<A> {
    pub(crate) fn detached() -> Self {
        Fiber {
            token: CancelToken::new(),
            // joiners must never miss the result, even from cancelled scopes
            result: Deferred::uncancellable(),
        }
    }

    /// Waits for the fiber's outcome, re-raising its error.
    ///
    /// Joining a cancelled fiber never completes: a cancelled run publishes
    /// no result. Compose a race externally when that matters.
    pub fn join(&self) -> Effect<A> {
        self.result.get().flat_map(Effect::from_result)
    }

    /// Cancels the fiber and completes once its finalizers have run.
    /// Idempotent. If the finalizers deadlock, so does this effect.
    pub fn cancel(&self) -> Effect<()> {
        self.token.cancel_effect()
    }
}

/// Forks `effect` onto the shared pool; the returned effect completes with
/// the handle as soon as the child run is submitted.
pub(crate) fn start<A: Clone + Send + 'static>(effect: Effect<A>) -> Effect<Fiber<A>> {
    let node = effect.node;
    Effect::from_node(Node::Async {
        trampoline_after: true,
        producer: Box::new(move |_token, _context, callback| {
            let fiber: Fiber<A> = Fiber::detached();
            let child_token = fiber.token.clone();
            let result = fiber.result.clone();

            executor::global().submit(Box::new(move || {
                run_loop::start(
                    node,
                    child_token,
                    Box::new(move |outcome| {
                        let _ = result.fulfil(outcome.map(unboxed::<A>));
                    }),
                );
            }));

            // submission happens-before anything the fiber can observe
            callback.invoke(Ok(boxed(fiber)));
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn join_returns_the_child_output() {
        let program = Effect::delay(|| 123).start().flat_map(|fiber| fiber.join());

        assert_eq!(block_on(program), Ok(123));
    }

    #[test]
    fn join_after_completion_returns_immediately() {
        let program = Effect::pure(7).start().flat_map(|fiber| {
            Effect::delay(|| std::thread::sleep(Duration::from_millis(20)))
                .flat_map(move |_| fiber.join())
        });

        assert_eq!(block_on(program), Ok(7));
    }

    #[test]
    fn every_clone_joins_the_same_result() {
        let program = Effect::delay(|| 5).start().flat_map(|fiber| {
            let twin = fiber.clone();
            fiber.join().flat_map(move |first| twin.join().map(move |second| first + second))
        });

        assert_eq!(block_on(program), Ok(10));
    }

    #[test]
    fn join_reraises_the_child_error() {
        let program = Effect::<i32>::raise_error(Error::raised("child failed"))
            .start()
            .flat_map(|fiber| fiber.join());

        assert_eq!(block_on(program), Err(Error::raised("child failed")));
    }

    #[test]
    fn fibers_run_concurrently_with_their_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let child_log = log.clone();
        let parent_log = log.clone();
        let program = Effect::delay(move || {
            std::thread::sleep(Duration::from_millis(30));
            child_log.lock().push("child");
        })
        .start()
        .flat_map(move |fiber| {
            parent_log.lock().push("parent");
            fiber.join()
        });

        block_on(program).unwrap();

        assert_eq!(*log.lock(), vec!["parent", "child"]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let finalizers = Arc::new(AtomicUsize::new(0));

        let counter = finalizers.clone();
        let body = Effect::<i32>::async_(|_cb| {
            // never completes
        })
        .guarantee(Effect::delay(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let program = body.start().flat_map(|fiber| {
            let again = fiber.clone();
            Effect::delay(|| std::thread::sleep(Duration::from_millis(30)))
                .flat_map(move |_| fiber.cancel())
                .flat_map(move |_| again.cancel())
        });

        block_on(program).unwrap();

        assert_eq!(finalizers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trait_implementations() {
        use impls::impls;

        assert!(impls!(Fiber<i32>: Send & Sync & Clone));
    }
}
