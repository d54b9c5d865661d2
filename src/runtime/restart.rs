//! One-shot resumption callback installed at asynchronous boundaries.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor;
use crate::node::{Frame, Node, Outcome, TerminalCb};
use crate::runtime::context::IoContext;
use crate::runtime::run_loop;
use crate::runtime::stack::FrameStack;
use crate::runtime::token::CancelToken;

/// Everything needed to resume a suspended interpretation.
pub(crate) struct SavedRun {
    pub(crate) token: CancelToken,
    pub(crate) first: Option<Frame>,
    pub(crate) rest: FrameStack,
    pub(crate) context: IoContext,
    pub(crate) terminal: TerminalCb,
    pub(crate) trampoline_after: bool,
}

/// Callback handed to an asynchronous producer.
///
/// The first invocation wins and takes the saved run out of the cell; later
/// invocations are dropped, with one diagnostic line when the dropped result
/// was an error. Taking the state out also lets the saved frames drop without
/// resuming when the scope was cancelled in the meantime.
#[derive(Clone)]
pub(crate) struct AsyncCallback {
    saved: Arc<Mutex<Option<SavedRun>>>,
}

impl AsyncCallback {
    pub(crate) fn new(saved: SavedRun) -> Self {
        AsyncCallback {
            saved: Arc::new(Mutex::new(Some(saved))),
        }
    }

    pub(crate) fn invoke(&self, result: Outcome) {
        let saved = self.saved.lock().take();
        match saved {
            None => {
                if let Err(error) = &result {
                    crate::report_failure("asynchronous callback invoked more than once", error);
                }
            }
            Some(saved) if saved.trampoline_after => {
                executor::trampoline(move || signal(saved, result));
            }
            Some(saved) => signal(saved, result),
        }
    }
}

/// Resumes the interpretation, unless its scope was cancelled while suspended.
fn signal(saved: SavedRun, result: Outcome) {
    if saved.token.is_cancelled() {
        // saved frames drop here; observable behaviour belongs to the
        // scope's finalizers
        return;
    }

    let source = match result {
        Ok(value) => Node::Pure(value),
        Err(error) => Node::RaiseError(error),
    };
    run_loop::restart(source, saved.token, saved.context, saved.first, saved.rest, saved.terminal);
}
