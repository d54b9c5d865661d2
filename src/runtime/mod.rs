//! Entry points for interpreting effects.

pub(crate) mod context;
pub(crate) mod restart;
pub(crate) mod run_loop;
pub(crate) mod stack;
pub(crate) mod token;

use crate::effect::Effect;
use crate::node::unboxed;
use crate::runtime::token::CancelToken;
use crate::{Error, ExitCode};

/// Interprets an effect that never crosses an asynchronous boundary.
///
/// Fails with an illegal-state error if the effect suspends.
pub fn run_sync<A: Send + 'static>(effect: Effect<A>) -> Result<A, Error> {
    run_loop::interpret_sync(effect.node).map(unboxed::<A>)
}

/// Interprets an effect, delivering the outcome to `callback` once it completes.
///
/// The callback may fire on the calling thread (for synchronous effects) or on
/// whichever thread completes the last asynchronous boundary.
pub fn run_async<A: Send + 'static>(
    effect: Effect<A>,
    callback: impl FnOnce(Result<A, Error>) + Send + 'static,
) {
    run_loop::start(
        effect.node,
        CancelToken::new(),
        Box::new(move |outcome| callback(outcome.map(unboxed::<A>))),
    );
}

/// Like [`run_async`], also returning an effect that cancels the running
/// interpretation.
///
/// Running the returned effect stops the interpretation at its next poll
/// point, runs pending finalizers most-recent-first, and completes after they
/// finish. A cancelled interpretation never invokes `callback`.
pub fn run_cancellable<A: Send + 'static>(
    effect: Effect<A>,
    callback: impl FnOnce(Result<A, Error>) + Send + 'static,
) -> Effect<()> {
    let token = CancelToken::new();
    run_loop::start(
        effect.node,
        token.clone(),
        Box::new(move |outcome| callback(outcome.map(unboxed::<A>))),
    );
    token.cancel_effect()
}

/// Blocks the calling thread until the effect completes.
pub fn block_on<A: Send + 'static>(effect: Effect<A>) -> Result<A, Error> {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    run_async(effect, move |outcome| {
        let _ = sender.send(outcome);
    });
    receiver.recv().expect("interpretation dropped without completing")
}

/// Runs a program effect to completion and maps its outcome to a process exit
/// code: the produced code on success, `1` on an uncaught error.
pub fn run_main(effect: Effect<ExitCode>) -> i32 {
    match block_on(effect) {
        Ok(code) => code.code(),
        Err(error) => {
            crate::report_failure("main effect failed", &error);
            ExitCode::ERROR.code()
        }
    }
}
