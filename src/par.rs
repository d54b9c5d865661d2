//! Concurrency combinators: racing, parallel mapping, bounded traversal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::executor;
use crate::fiber::Fiber;
use crate::node::{boxed, unboxed, Node, Value};
use crate::runtime::restart::AsyncCallback;
use crate::runtime::run_loop;
use crate::runtime::token::CancelToken;
use crate::sync::semaphore::Semaphore;
use crate::Error;

/// One of two alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// Runs both effects concurrently; the first to finish wins and the loser is
/// cancelled. A winner that failed surfaces its error.
pub fn race<A, B>(fa: Effect<A>, fb: Effect<B>) -> Effect<Either<A, B>>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    race_pair(fa, fb).flat_map(|winner| match winner {
        Either::Left((value, loser)) => loser.cancel().map(move |_| Either::Left(value)),
        Either::Right((loser, value)) => loser.cancel().map(move |_| Either::Right(value)),
    })
}

/// Runs both effects concurrently; the first to finish wins and the loser is
/// handed back as a running fiber.
pub fn race_pair<A, B>(fa: Effect<A>, fb: Effect<B>) -> Effect<Either<(A, Fiber<B>), (Fiber<A>, B)>>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    Effect::from_node(Node::Async {
        trampoline_after: true,
        producer: Box::new(move |token, _context, callback| {
            let left: Fiber<A> = Fiber::detached();
            let right: Fiber<B> = Fiber::detached();
            let settled = Arc::new(AtomicBool::new(false));

            // cancelling the race cancels both contenders
            let both = cancel_all(vec![left.token.clone(), right.token.clone()]);
            if token.try_push(both.node).is_err() {
                return;
            }

            let right_handle = right.clone();
            contend(
                fa.node,
                left.clone(),
                right.token.clone(),
                settled.clone(),
                token.clone(),
                callback.clone(),
                move |value: A| {
                    boxed::<Either<(A, Fiber<B>), (Fiber<A>, B)>>(Either::Left((value, right_handle)))
                },
            );

            let left_handle = left.clone();
            contend(
                fb.node,
                right,
                left.token.clone(),
                settled,
                token,
                callback,
                move |value: B| {
                    boxed::<Either<(A, Fiber<B>), (Fiber<A>, B)>>(Either::Right((left_handle, value)))
                },
            );
        }),
    })
}

/// Runs one side of a race: publishes the outcome on the contender's own
/// fiber, and settles the race if it got there first.
fn contend<W: Clone + Send + 'static>(
    node: Node,
    own: Fiber<W>,
    loser_token: CancelToken,
    settled: Arc<AtomicBool>,
    outer: CancelToken,
    callback: AsyncCallback,
    winner_value: impl FnOnce(W) -> Value + Send + 'static,
) {
    let run_token = own.token.clone();
    executor::global().submit(Box::new(move || {
        run_loop::start(
            node,
            run_token,
            Box::new(move |outcome| {
                let typed = outcome.map(unboxed::<W>);
                let _ = own.result.fulfil(typed.clone());

                if !settled.swap(true, Ordering::AcqRel) {
                    drop(outer.pop());
                    match typed {
                        Ok(value) => callback.invoke(Ok(winner_value(value))),
                        Err(error) => {
                            cancel_quietly(loser_token);
                            callback.invoke(Err(error));
                        }
                    }
                }
            }),
        );
    }));
}

/// Runs both effects concurrently and combines their results.
pub fn par_map2<A, B, C>(
    fa: Effect<A>,
    fb: Effect<B>,
    f: impl FnOnce(A, B) -> C + Send + 'static,
) -> Effect<C>
where
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    par_all(vec![fa.map(Either::Left), fb.map(Either::Right)]).map(move |mut values| {
        let second = values.pop();
        let first = values.pop();
        match (first, second) {
            (Some(Either::Left(a)), Some(Either::Right(b))) => f(a, b),
            _ => unreachable!("parallel pair lost its order"),
        }
    })
}

/// Maps every item to an effect and runs them with at most `limit` bodies in
/// flight at once.
///
/// Results arrive in input order regardless of completion order. The first
/// failure cancels the remaining work and surfaces; later sibling outcomes
/// are discarded. Cancelling the traversal cancels every in-flight body and
/// wakes the queued ones.
pub fn parallel_traverse_n<A, B, F>(limit: usize, items: Vec<A>, f: F) -> Effect<Vec<B>>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> Effect<B> + Send + 'static,
{
    Effect::suspend(move || {
        if limit == 0 {
            return Effect::raise_error(Error::illegal_state("parallelism limit must be at least 1"));
        }
        let semaphore = Semaphore::new(limit);
        let guarded = items
            .into_iter()
            .map(|item| semaphore.with_permit(f(item)))
            .collect();
        par_all(guarded)
    })
}

/// [`parallel_traverse_n`] over already-built effects.
pub fn parallel_sequence_n<B: Send + 'static>(limit: usize, effects: Vec<Effect<B>>) -> Effect<Vec<B>> {
    parallel_traverse_n(limit, effects, |effect| effect)
}

/// Runs `copies` effects from the factory with at most `limit` in flight.
/// Takes a factory because effect values are one-shot.
pub fn parallel_replicate_n<B, F>(limit: usize, copies: usize, factory: F) -> Effect<Vec<B>>
where
    B: Send + 'static,
    F: Fn() -> Effect<B> + Send + 'static,
{
    Effect::suspend(move || {
        let effects = (0..copies).map(|_| factory()).collect();
        parallel_sequence_n(limit, effects)
    })
}

/// Unbounded fan-out over the shared pool: every effect runs under its own
/// child scope, results are collected in input order, and the first failure
/// settles the whole family.
fn par_all<B: Send + 'static>(effects: Vec<Effect<B>>) -> Effect<Vec<B>> {
    Effect::from_node(Node::Async {
        trampoline_after: true,
        producer: Box::new(move |token, _context, callback| {
            let total = effects.len();
            if total == 0 {
                callback.invoke(Ok(boxed(Vec::<B>::new())));
                return;
            }

            let slots: Arc<Mutex<Vec<Option<B>>>> =
                Arc::new(Mutex::new((0..total).map(|_| None).collect()));
            let remaining = Arc::new(AtomicUsize::new(total));
            let settled = Arc::new(AtomicBool::new(false));
            let children: Vec<CancelToken> = (0..total).map(|_| CancelToken::new()).collect();

            // cancelling the fan-out cancels every child
            if token.try_push(cancel_all(children.clone()).node).is_err() {
                return;
            }

            for (index, effect) in effects.into_iter().enumerate() {
                let child = children[index].clone();
                let slots = slots.clone();
                let remaining = remaining.clone();
                let settled = settled.clone();
                let siblings = children.clone();
                let outer = token.clone();
                let callback = callback.clone();

                executor::global().submit(Box::new(move || {
                    run_loop::start(
                        effect.node,
                        child,
                        Box::new(move |outcome| match outcome {
                            Ok(value) => {
                                slots.lock()[index] = Some(unboxed::<B>(value));
                                let last = remaining.fetch_sub(1, Ordering::AcqRel) == 1;
                                if last && !settled.swap(true, Ordering::AcqRel) {
                                    drop(outer.pop());
                                    let collected = slots
                                        .lock()
                                        .iter_mut()
                                        .map(|slot| slot.take().expect("every sibling reported"))
                                        .collect::<Vec<B>>();
                                    callback.invoke(Ok(boxed(collected)));
                                }
                            }
                            Err(error) => {
                                if !settled.swap(true, Ordering::AcqRel) {
                                    drop(outer.pop());
                                    for sibling in siblings {
                                        cancel_quietly(sibling);
                                    }
                                    callback.invoke(Err(error));
                                }
                                // later sibling outcomes are discarded
                            }
                        }),
                    );
                }));
            }
        }),
    })
}

/// Effect that cancels every scope in turn, waiting for each one's finalizers.
fn cancel_all(tokens: Vec<CancelToken>) -> Effect<()> {
    tokens.into_iter().fold(Effect::unit(), |acc, token| {
        acc.flat_map(move |_| token.cancel_effect())
    })
}

/// Fires a cancellation outside any interpretation, reporting failures to the
/// diagnostic stream.
fn cancel_quietly(token: CancelToken) {
    executor::trampoline(move || {
        run_loop::start(
            token.cancel_effect().node,
            CancelToken::uncancellable(),
            Box::new(|outcome| {
                if let Err(error) = outcome {
                    crate::report_failure("sibling cancellation failed", &error);
                }
            }),
        );
    });
}
