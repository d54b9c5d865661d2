//! Task submission: the shared worker pool and the current-thread trampoline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic;
use std::sync::OnceLock;
use std::thread;

/// A unit of work accepted by an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs submitted tasks, each exactly once, never inline on the caller's thread.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

/// Fixed pool of worker threads fed over a channel.
///
/// Tasks run in submission order per worker but interleave across workers.
/// A panicking task is reported and does not take its worker down.
pub struct ThreadPool {
    sender: crossbeam_channel::Sender<Task>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a pool needs at least one worker");
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();

        for n in 0..workers {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("latent-worker-{n}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        if panic::catch_unwind(panic::AssertUnwindSafe(task)).is_err() {
                            tracing::error!("submitted task panicked");
                        }
                    }
                })
                .expect("failed to spawn worker thread");
        }

        ThreadPool { sender }
    }

    pub fn submit(&self, task: Task) {
        self.sender.send(task).expect("worker threads disconnected");
    }
}

impl Executor for ThreadPool {
    fn submit(&self, task: Task) {
        ThreadPool::submit(self, task);
    }
}

/// Process-wide pool used to start fibers and dispatch completions.
pub fn global() -> &'static ThreadPool {
    static GLOBAL: OnceLock<ThreadPool> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let workers = thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(4);
        ThreadPool::new(workers.max(2))
    })
}

thread_local! {
    static TRAMPOLINE: RefCell<TrampolineState> = RefCell::new(TrampolineState {
        running: false,
        queue: VecDeque::new(),
    });
}

struct TrampolineState {
    running: bool,
    queue: VecDeque<Task>,
}

/// Runs `task` on the current thread without growing the native stack:
/// re-entrant submissions are queued and drained by the outermost call.
pub(crate) fn trampoline(task: impl FnOnce() + Send + 'static) {
    let mut task: Option<Task> = Some(Box::new(task));

    TRAMPOLINE.with(|cell| {
        {
            let mut state = cell.borrow_mut();
            if state.running {
                state.queue.push_back(task.take().expect("task already taken"));
                return;
            }
            state.running = true;
        }

        let mut next = task.take();
        while let Some(run) = next {
            // the task may re-enter and push onto the queue
            if panic::catch_unwind(panic::AssertUnwindSafe(run)).is_err() {
                tracing::error!("trampolined task panicked");
            }
            next = cell.borrow_mut().queue.pop_front();
        }
        cell.borrow_mut().running = false;
    });
}
