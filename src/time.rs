//! Timer hooks consumed by user code.
//!
//! The runtime itself never sleeps; programs that need time take it through
//! the [`Timer`] seam. [`ThreadTimer`] is a modest default for tests and small
//! programs; anything at scale should bring its own wheel.

use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use crate::effect::Effect;

pub trait Timer {
    /// Completes after the duration has elapsed.
    fn sleep(&self, duration: Duration) -> Effect<()>;

    /// Time since an arbitrary fixed point; only differences are meaningful.
    fn monotonic_now(&self) -> Effect<Duration>;
}

/// Timer backed by one short-lived sleeper thread per call.
pub struct ThreadTimer;

impl Timer for ThreadTimer {
    fn sleep(&self, duration: Duration) -> Effect<()> {
        Effect::async_(move |cb| {
            thread::spawn(move || {
                thread::sleep(duration);
                cb.succeed(());
            });
        })
    }

    fn monotonic_now(&self) -> Effect<Duration> {
        Effect::delay(move || epoch().elapsed())
    }
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;

    mod sleep {
        use super::*;

        #[test]
        fn passes_time() {
            let before = Instant::now();

            block_on(ThreadTimer.sleep(Duration::from_millis(20))).unwrap();

            assert!(before.elapsed() >= Duration::from_millis(20));
        }

        #[test]
        fn returns_immediately_with_zero() {
            let before = Instant::now();

            block_on(ThreadTimer.sleep(Duration::from_millis(0))).unwrap();

            assert!(before.elapsed() <= Duration::from_millis(20));
        }
    }

    mod monotonic_now {
        use super::*;

        #[test]
        fn never_goes_backwards() {
            let first = block_on(ThreadTimer.monotonic_now()).unwrap();
            let second = block_on(ThreadTimer.monotonic_now()).unwrap();

            assert!(second >= first);
        }
    }
}
