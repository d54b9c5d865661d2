//! Mutable cell shared between effects.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;

/// Shared mutable cell whose operations are effects.
///
/// Handles are cheap to clone; all handles see the same value. Update
/// closures run under a short critical section and must be pure: no blocking,
/// no effects of their own.
pub struct Ref<A> {
    value: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Ref {
            value: self.value.clone(),
        }
    }
}

impl<A: Send + 'static> Ref<A> {
    pub fn new(initial: A) -> Self {
        Ref {
            value: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> Effect<A>
    where
        A: Clone,
    {
        let cell = self.clone();
        Effect::delay(move || cell.value.lock().clone())
    }

    pub fn set(&self, value: A) -> Effect<()> {
        let cell = self.clone();
        Effect::delay(move || *cell.value.lock() = value)
    }

    pub fn get_and_set(&self, value: A) -> Effect<A> {
        let cell = self.clone();
        Effect::delay(move || mem::replace(&mut *cell.value.lock(), value))
    }

    pub fn update(&self, f: impl FnOnce(&mut A) + Send + 'static) -> Effect<()> {
        let cell = self.clone();
        Effect::delay(move || f(&mut *cell.value.lock()))
    }

    /// Updates the value and returns something derived from it.
    pub fn modify<B: Send + 'static>(&self, f: impl FnOnce(&mut A) -> B + Send + 'static) -> Effect<B> {
        let cell = self.clone();
        Effect::delay(move || f(&mut *cell.value.lock()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::run_sync;

    #[test]
    fn stores_and_reads() {
        let cell = Ref::new(1);

        run_sync(cell.set(2)).unwrap();

        assert_eq!(run_sync(cell.get()), Ok(2));
    }

    #[test]
    fn get_and_set_returns_the_previous_value() {
        let cell = Ref::new(1);

        assert_eq!(run_sync(cell.get_and_set(2)), Ok(1));
        assert_eq!(run_sync(cell.get()), Ok(2));
    }

    #[test]
    fn update_applies_in_place() {
        let cell = Ref::new(10);

        run_sync(cell.update(|n| *n += 5)).unwrap();

        assert_eq!(run_sync(cell.get()), Ok(15));
    }

    #[test]
    fn modify_derives_a_result() {
        let cell = Ref::new(3);

        let doubled = cell.modify(|n| {
            *n *= 2;
            *n
        });

        assert_eq!(run_sync(doubled), Ok(6));
        assert_eq!(run_sync(cell.get()), Ok(6));
    }

    #[test]
    fn handles_share_the_value() {
        let cell = Ref::new(0);
        let other = cell.clone();

        run_sync(cell.update(|n| *n += 1)).unwrap();

        assert_eq!(run_sync(other.get()), Ok(1));
    }
}
