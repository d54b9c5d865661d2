//! Internal description of a computation: the tagged tree the interpreter consumes.
//!
//! Values travelling between continuations are type-erased; the public
//! [`crate::effect::Effect`] wrapper pairs every node with a phantom type so
//! construction and elimination always agree on the concrete type behind the box.

use std::any::Any;
use std::panic;

use crate::runtime::context::IoContext;
use crate::runtime::restart::AsyncCallback;
use crate::runtime::token::CancelToken;
use crate::Error;

/// Type-erased value moving through the interpreter.
pub(crate) type Value = Box<dyn Any + Send>;

/// Final result of an interpretation.
pub(crate) type Outcome = Result<Value, Error>;

/// Callback receiving the final result of an interpretation.
pub(crate) type TerminalCb = Box<dyn FnOnce(Outcome) + Send>;

pub(crate) type Thunk = Box<dyn FnOnce() -> Value + Send>;
pub(crate) type SuspendThunk = Box<dyn FnOnce() -> Node + Send>;
pub(crate) type Producer = Box<dyn FnOnce(CancelToken, IoContext, AsyncCallback) + Send>;
pub(crate) type ModifyFn = Box<dyn FnOnce(CancelToken) -> CancelToken + Send>;
pub(crate) type RestoreFn = Box<dyn FnOnce(&Outcome, CancelToken, CancelToken) -> CancelToken + Send>;
pub(crate) type MapFn = Box<dyn FnOnce(Value) -> Value + Send>;
pub(crate) type BindFn = Box<dyn FnOnce(Value) -> Node + Send>;
pub(crate) type RecoverFn = Box<dyn FnOnce(Error) -> Node + Send>;

/// One computation step. A closed sum: the interpreter dispatches on the tag.
pub(crate) enum Node {
    /// Already-evaluated value.
    Pure(Value),
    /// Produces a value synchronously; panics are captured as errors.
    Delay(Thunk),
    /// Produces the next node; enables recursion without evaluation.
    Suspend(SuspendThunk),
    /// Unconditional failure.
    RaiseError(Error),
    /// Sequential composition: run the chain, then apply the frame.
    Bind(Chain, Frame),
    /// Suspension point: the producer arranges for the callback to fire once.
    Async {
        producer: Producer,
        /// Resume through the trampoline instead of on the producer's stack.
        trampoline_after: bool,
    },
    /// Rewrites the active cancellation token around `inner`.
    ContextSwitch {
        inner: Chain,
        modify: ModifyFn,
        restore: Option<RestoreFn>,
    },
}

impl Node {
    pub(crate) fn unit() -> Node {
        Node::Pure(boxed(()))
    }
}

/// Continuation suspended while an inner node is evaluated.
pub(crate) enum Frame {
    /// Value to value.
    Map(MapFn),
    /// Value to next node.
    Bind(BindFn),
    /// Success and failure arms. A missing success arm passes values through
    /// untouched, so a pure error handler costs nothing on the happy path.
    Handler {
        on_value: Option<BindFn>,
        on_error: RecoverFn,
    },
    /// Token restoration installed by a context switch; applied on both the
    /// value path and the error path.
    Restore {
        previous: CancelToken,
        restore: RestoreFn,
    },
}

/// Boxed child node.
///
/// Long bind chains form deep box chains; the derived recursive drop would
/// overflow the native stack when an unevaluated chain is abandoned, so
/// teardown walks the chain iteratively.
pub(crate) struct Chain(Option<Box<Node>>);

impl Chain {
    pub(crate) fn new(node: Node) -> Self {
        Chain(Some(Box::new(node)))
    }

    pub(crate) fn into_node(mut self) -> Node {
        *self.0.take().expect("chain already consumed")
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        if let Some(node) = self.0.take() {
            pending.push(*node);
        }

        while let Some(node) = pending.pop() {
            match node {
                Node::Bind(mut inner, frame) => {
                    if let Some(next) = inner.0.take() {
                        pending.push(*next);
                    }
                    drop(frame);
                }
                Node::ContextSwitch { mut inner, .. } => {
                    if let Some(next) = inner.0.take() {
                        pending.push(*next);
                    }
                }
                other => drop(other),
            }
        }
    }
}

pub(crate) fn boxed<A: Send + 'static>(value: A) -> Value {
    Box::new(value)
}

pub(crate) fn unboxed<A: 'static>(value: Value) -> A {
    match value.downcast::<A>() {
        Ok(concrete) => *concrete,
        Err(_) => unreachable!("value crossed a continuation boundary with the wrong type"),
    }
}

/// Runs a thunk, converting a panic into an error.
pub(crate) fn catching<T>(f: impl FnOnce() -> T) -> Result<T, Error> {
    panic::catch_unwind(panic::AssertUnwindSafe(f)).map_err(|payload| Error::Panicked(panic_message(payload)))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
