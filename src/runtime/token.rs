//! Cooperative cancellation scope threaded through the interpreter.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::node::Node;
use crate::Error;

/// Shared cancellation scope: a LIFO of finalizer effects plus a monotonic
/// cancelled flag.
///
/// Handles are cheap to clone and may be shared across threads. The cancelled
/// flag is read lock-free on the interpreter's hot path; the finalizer stack
/// sits behind a short critical section and is claimed in one step by cancel.
#[derive(Clone)]
pub(crate) struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    /// Inert tokens ignore push/pop/cancel and never read cancelled. They
    /// guard acquisition phases that must not be interrupted.
    reactive: bool,
    cancelled: AtomicBool,
    /// While positive, the interpreter reads `is_cancelled` as false; a
    /// pending cancel is latched and observed at the next unmasked poll.
    mask_depth: AtomicUsize,
    /// `None` once cancel has claimed the stack; later pushes are refused.
    finalizers: Mutex<Option<Vec<Node>>>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                reactive: true,
                cancelled: AtomicBool::new(false),
                mask_depth: AtomicUsize::new(0),
                finalizers: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Token that cannot be cancelled and retains no finalizers.
    pub(crate) fn uncancellable() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                reactive: false,
                cancelled: AtomicBool::new(false),
                mask_depth: AtomicUsize::new(0),
                finalizers: Mutex::new(None),
            }),
        }
    }

    /// Records a finalizer to run on cancellation. Refused once cancelled,
    /// handing the finalizer back so the caller can settle it. Inert scopes
    /// accept and discard: they can never cancel, so the finalizer can never
    /// be needed.
    pub(crate) fn try_push(&self, finalizer: Node) -> Result<(), Node> {
        if !self.inner.reactive {
            drop(finalizer);
            return Ok(());
        }
        match &mut *self.inner.finalizers.lock() {
            Some(stack) => {
                stack.push(finalizer);
                Ok(())
            }
            None => Err(finalizer),
        }
    }

    /// Removes and returns the most recent finalizer, or a unit node when
    /// there is none to return.
    pub(crate) fn pop(&self) -> Node {
        if let Some(stack) = &mut *self.inner.finalizers.lock() {
            if let Some(finalizer) = stack.pop() {
                return finalizer;
            }
        }
        Node::unit()
    }

    /// Marks the scope cancelled and claims the pending finalizers, most
    /// recent last. Later claims see an empty stack.
    pub(crate) fn cancel_now(&self) -> Vec<Node> {
        if !self.inner.reactive {
            return Vec::new();
        }
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.finalizers.lock().take().unwrap_or_default()
    }

    /// Effect that cancels this scope and runs its finalizers most-recent-first.
    ///
    /// Completes only after every finalizer has run. The first finalizer
    /// failure becomes the effect's outcome; the rest go to the diagnostic
    /// stream. Idempotent.
    pub(crate) fn cancel_effect(&self) -> Effect<()> {
        let token = self.clone();
        Effect::suspend(move || run_finalizers(token.cancel_now(), None))
    }

    /// The interpreter's view: masked scopes read as not cancelled.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.reactive
            && self.inner.mask_depth.load(Ordering::Acquire) == 0
            && self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn push_mask(&self) {
        if self.inner.reactive {
            self.inner.mask_depth.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn pop_mask(&self) {
        if self.inner.reactive {
            let previous = self.inner.mask_depth.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "unbalanced mask");
        }
    }
}

/// Runs claimed finalizers in reverse push order, surfacing the first failure
/// once all have run.
fn run_finalizers(mut remaining: Vec<Node>, first_error: Option<Error>) -> Effect<()> {
    let finalizer = match remaining.pop() {
        Some(finalizer) => Effect::<()>::from_node(finalizer),
        None => {
            return match first_error {
                None => Effect::unit(),
                Some(error) => Effect::raise_error(error),
            }
        }
    };

    finalizer.attempt().flat_map(move |outcome| {
        let first_error = match (first_error, outcome) {
            (None, Err(error)) => Some(error),
            (Some(first), Err(later)) => {
                crate::report_failure("finalizer failed during cancellation", &later);
                Some(first)
            }
            (first, Ok(())) => first,
        };
        run_finalizers(remaining, first_error)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::boxed;
    use crate::runtime::run_sync;

    fn recording(log: &Arc<Mutex<Vec<i32>>>, entry: i32) -> Node {
        let log = log.clone();
        Effect::delay(move || log.lock().push(entry)).node
    }

    #[test]
    fn pop_returns_most_recent() {
        let token = CancelToken::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(token.try_push(recording(&log, 1)).is_ok());
        assert!(token.try_push(recording(&log, 2)).is_ok());

        run_sync(Effect::<()>::from_node(token.pop())).unwrap();

        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn pop_on_empty_is_unit() {
        let token = CancelToken::new();

        assert!(run_sync(Effect::<()>::from_node(token.pop())).is_ok());
    }

    #[test]
    fn cancel_runs_finalizers_in_reverse_order() {
        let token = CancelToken::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(token.try_push(recording(&log, 1)).is_ok());
        assert!(token.try_push(recording(&log, 2)).is_ok());
        assert!(token.try_push(recording(&log, 3)).is_ok());

        run_sync(token.cancel_effect()).unwrap();

        assert_eq!(*log.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(token.try_push(recording(&log, 1)).is_ok());

        run_sync(token.cancel_effect()).unwrap();
        run_sync(token.cancel_effect()).unwrap();

        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn first_finalizer_failure_wins() {
        let token = CancelToken::new();
        assert!(token.try_push(Node::RaiseError(Error::raised("second"))).is_ok());
        assert!(token.try_push(Node::RaiseError(Error::raised("first"))).is_ok());

        let error = run_sync(token.cancel_effect()).unwrap_err();

        assert_eq!(error, Error::raised("first"));
    }

    #[test]
    fn push_after_cancel_is_not_retained() {
        let token = CancelToken::new();
        token.cancel_now();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(token.try_push(recording(&log, 1)).is_err());

        run_sync(token.cancel_effect()).unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn mask_hides_cancellation_until_popped() {
        let token = CancelToken::new();
        token.push_mask();
        token.cancel_now();

        assert!(!token.is_cancelled());
        token.pop_mask();
        assert!(token.is_cancelled());
    }

    #[test]
    fn inert_token_ignores_everything() {
        let token = CancelToken::uncancellable();
        assert!(token.try_push(Node::Pure(boxed(()))).is_ok());
        token.cancel_now();

        assert!(!token.is_cancelled());
        assert!(token.cancel_now().is_empty());
    }
}
