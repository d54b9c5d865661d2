//! Per-interpretation trace side channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Breadcrumbs for one interpretation, created lazily at the first
/// asynchronous boundary and discarded when the terminal callback fires.
///
/// Producers receive a handle so suspension points can be accounted for;
/// unhandled failures that crossed at least one boundary are annotated on the
/// diagnostic stream.
#[derive(Clone)]
pub(crate) struct IoContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    boundaries: AtomicU64,
}

impl IoContext {
    pub(crate) fn new() -> Self {
        IoContext {
            inner: Arc::new(ContextInner {
                boundaries: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn async_boundary(&self) {
        self.inner.boundaries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn boundaries(&self) -> u64 {
        self.inner.boundaries.load(Ordering::Relaxed)
    }
}
