//! The trampolined interpreter.
//!
//! Evaluates one effect tree on the calling thread until it produces a value,
//! an error, or suspends at an asynchronous boundary. Continuations live on an
//! explicit frame stack, so arbitrarily nested compositions run in constant
//! native stack space. Suspended runs are resumed by
//! [`crate::runtime::restart::AsyncCallback`] with the saved frames.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::{catching, Frame, Node, Outcome, TerminalCb};
use crate::runtime::context::IoContext;
use crate::runtime::restart::{AsyncCallback, SavedRun};
use crate::runtime::stack::FrameStack;
use crate::runtime::token::CancelToken;
use crate::Error;

/// Cancellation is polled once per this many synchronous steps.
const AUTO_CANCEL_BATCH: u32 = 512;

/// Begins a fresh interpretation.
pub(crate) fn start(node: Node, token: CancelToken, terminal: TerminalCb) {
    interpret(node, token, None, None, FrameStack::new(), terminal, false);
}

/// Resumes a suspended interpretation with its saved frames.
pub(crate) fn restart(
    node: Node,
    token: CancelToken,
    context: IoContext,
    first: Option<Frame>,
    rest: FrameStack,
    terminal: TerminalCb,
) {
    interpret(node, token, Some(context), first, rest, terminal, false);
}

/// Evaluates a tree that never suspends; an asynchronous boundary is an error.
pub(crate) fn interpret_sync(node: Node) -> Outcome {
    let slot: Arc<Mutex<Option<Outcome>>> = Arc::new(Mutex::new(None));
    let result = slot.clone();
    interpret(
        node,
        CancelToken::new(),
        None,
        None,
        FrameStack::new(),
        Box::new(move |outcome| *result.lock() = Some(outcome)),
        true,
    );

    let taken = slot.lock().take();
    match taken {
        Some(outcome) => outcome,
        None => unreachable!("synchronous interpretation finished without a result"),
    }
}

fn interpret(
    node: Node,
    mut token: CancelToken,
    mut context: Option<IoContext>,
    mut first: Option<Frame>,
    mut rest: FrameStack,
    terminal: TerminalCb,
    sync_only: bool,
) {
    let mut current = Some(node);
    let mut unboxed = None;
    let mut steps_until_poll = AUTO_CANCEL_BATCH;

    loop {
        if unboxed.is_none() {
            match current.take().expect("interpreter lost its current node") {
                Node::Pure(value) => unboxed = Some(value),
                Node::Delay(thunk) => match catching(thunk) {
                    Ok(value) => unboxed = Some(value),
                    Err(error) => current = Some(Node::RaiseError(error)),
                },
                Node::Suspend(thunk) => match catching(thunk) {
                    Ok(next) => current = Some(next),
                    Err(error) => current = Some(Node::RaiseError(error)),
                },
                Node::RaiseError(error) => {
                    match unwind_to_handler(error, &mut first, &mut rest, &mut token) {
                        Unwound::Recovered(next) => current = Some(next),
                        Unwound::Surfaced(error) => {
                            annotate_failure(&context, &error);
                            terminal(Err(error));
                            return;
                        }
                    }
                }
                Node::Bind(inner, frame) => {
                    if let Some(occupied) = first.take() {
                        rest.push(occupied);
                    }
                    first = Some(frame);
                    current = Some(inner.into_node());
                }
                Node::Async { producer, trampoline_after } => {
                    if sync_only {
                        terminal(Err(Error::illegal_state(
                            "asynchronous boundary in a synchronous interpretation",
                        )));
                        return;
                    }
                    let trace = context.take().unwrap_or_else(IoContext::new);
                    trace.async_boundary();
                    let callback = AsyncCallback::new(SavedRun {
                        token: token.clone(),
                        first: first.take(),
                        rest,
                        context: trace.clone(),
                        terminal,
                        trampoline_after,
                    });
                    producer(token, trace, callback);
                    return;
                }
                Node::ContextSwitch { inner, modify, restore } => {
                    let previous = token.clone();
                    token = modify(token);
                    if let Some(restore) = restore {
                        if let Some(occupied) = first.take() {
                            rest.push(occupied);
                        }
                        first = Some(Frame::Restore { previous, restore });
                    }
                    current = Some(inner.into_node());
                }
            }
        }

        if let Some(value) = unboxed.take() {
            match next_frame(&mut first, &mut rest) {
                None => {
                    terminal(Ok(value));
                    return;
                }
                Some(Frame::Map(f)) => match catching(move || f(value)) {
                    Ok(mapped) => unboxed = Some(mapped),
                    Err(error) => current = Some(Node::RaiseError(error)),
                },
                Some(Frame::Bind(f)) => match catching(move || f(value)) {
                    Ok(next) => current = Some(next),
                    Err(error) => current = Some(Node::RaiseError(error)),
                },
                Some(Frame::Handler { on_value, on_error }) => {
                    drop(on_error);
                    match on_value {
                        // a pure error handler lets values through untouched
                        None => unboxed = Some(value),
                        Some(f) => match catching(move || f(value)) {
                            Ok(next) => current = Some(next),
                            Err(error) => current = Some(Node::RaiseError(error)),
                        },
                    }
                }
                Some(Frame::Restore { previous, restore }) => {
                    let outcome: Outcome = Ok(value);
                    token = restore(&outcome, previous, token.clone());
                    match outcome {
                        Ok(value) => unboxed = Some(value),
                        Err(_) => unreachable!(),
                    }
                }
            }
        }

        steps_until_poll -= 1;
        if steps_until_poll == 0 {
            steps_until_poll = AUTO_CANCEL_BATCH;
            if token.is_cancelled() {
                // stop silently; observable behaviour belongs to the scope's finalizers
                return;
            }
        }
    }
}

fn next_frame(first: &mut Option<Frame>, rest: &mut FrameStack) -> Option<Frame> {
    first.take().or_else(|| rest.pop())
}

enum Unwound {
    Recovered(Node),
    Surfaced(Error),
}

/// Pops frames until an error handler accepts the failure. Plain frames are
/// discarded, restore frames still run for token hygiene, and fatal errors
/// bypass handlers entirely.
fn unwind_to_handler(
    mut error: Error,
    first: &mut Option<Frame>,
    rest: &mut FrameStack,
    token: &mut CancelToken,
) -> Unwound {
    loop {
        match next_frame(first, rest) {
            None => return Unwound::Surfaced(error),
            Some(Frame::Handler { on_error, .. }) if !error.is_fatal() => {
                match catching(move || on_error(error)) {
                    Ok(next) => return Unwound::Recovered(next),
                    // a recovery that raises re-enters the unwind
                    Err(raised) => error = raised,
                }
            }
            Some(Frame::Restore { previous, restore }) => {
                let outcome: Outcome = Err(error);
                *token = restore(&outcome, previous, token.clone());
                match outcome {
                    Err(original) => error = original,
                    Ok(_) => unreachable!(),
                }
            }
            Some(_) => {}
        }
    }
}

fn annotate_failure(context: &Option<IoContext>, error: &Error) {
    if let Some(trace) = context {
        if trace.boundaries() > 0 {
            tracing::debug!(
                boundaries = trace.boundaries(),
                error = %error,
                "effect failed after asynchronous boundaries",
            );
        }
    }
}
