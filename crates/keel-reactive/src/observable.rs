#![forbid(unsafe_code)]

//! Pull-based, version-tracked observable cell.
//!
//! # Usage
//!
//! ```
//! use keel_reactive::Observable;
//!
//! let count = Observable::new(0);
//! let _sub = count.subscribe(|v| assert!(*v > 0));
//! count.set(3);
//! assert_eq!(count.get(), 3);
//! assert_eq!(count.version(), 1);
//! ```
//!
//! # Failure Modes
//!
//! - Listener panic: propagates to the caller of `set()` (or to the
//!   [`BatchScope`](crate::BatchScope) drop that flushed it).
//! - Cell dropped while a subscription is alive: the subscription is inert.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::batch::defer_or_run;
use crate::subscribable::{Listeners, Subscribable, Subscription};

/// Equality predicate deciding whether a write is a change.
pub type Equality<T> = Rc<dyn Fn(&T, &T) -> bool>;

struct Inner<T> {
    value: T,
    version: u64,
    equals: Equality<T>,
    listeners: Listeners<T>,
}

/// A shared, version-tracked value with change notification.
///
/// Clones share the same underlying cell.
pub struct Observable<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    /// Create a cell that treats `PartialEq`-equal writes as no-ops.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_equality(value, Rc::new(|a: &T, b: &T| a == b))
    }
}

impl<T: Clone + 'static> Observable<T> {
    /// Create a cell with a custom change predicate.
    ///
    /// `equals(old, new) == true` makes a write a no-op.
    #[must_use]
    pub fn with_equality(value: T, equals: Equality<T>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                value,
                version: 0,
                equals,
                listeners: Listeners::new(),
            })),
        }
    }

    /// Clone out the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.borrow().value.clone()
    }

    /// Borrow the current value for the duration of `f`.
    ///
    /// `f` must not write to this cell.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.borrow().value)
    }

    /// Store `value`, notifying subscribers if it differs from the current one.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if (inner.equals)(&inner.value, &value) {
                return false;
            }
            inner.value = value;
            inner.version += 1;
        }
        self.notify();
        true
    }

    /// Derive the next value from the current one and store it.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let next = self.with(f);
        self.set(next)
    }

    /// Number of changes since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    /// Register a change listener.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        self.inner.borrow_mut().listeners.add(Box::new(callback))
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    /// Detach every subscriber. Existing guards become inert.
    pub fn clear_subscribers(&self) {
        self.inner.borrow_mut().listeners.clear();
    }

    fn notify(&self) {
        let weak: Weak<RefCell<Inner<T>>> = Rc::downgrade(&self.inner);
        let key = Rc::as_ptr(&self.inner) as *const () as usize;
        defer_or_run(Some(key), move || {
            if let Some(inner) = weak.upgrade() {
                notify_inner(&inner);
            }
        });
    }
}

fn notify_inner<T: Clone + 'static>(inner: &Rc<RefCell<Inner<T>>>) {
    let (value, callbacks) = {
        let mut guard = inner.borrow_mut();
        let callbacks = guard.listeners.live();
        (guard.value.clone(), callbacks)
    };
    for callback in callbacks {
        callback(&value);
    }
}

impl<T: Clone + 'static> Subscribable<T> for Observable<T> {
    fn get(&self) -> T {
        Observable::get(self)
    }

    fn subscribe(&self, listener: Box<dyn Fn(&T)>) -> Subscription {
        self.inner.borrow_mut().listeners.add(listener)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Observable")
            .field("value", &inner.value)
            .field("version", &inner.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BatchScope;
    use std::cell::Cell;

    #[test]
    fn equal_write_is_noop() {
        let obs = Observable::new(5);
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let _sub = obs.subscribe(move |_| h.set(h.get() + 1));

        assert!(!obs.set(5));
        assert_eq!(obs.version(), 0);
        assert_eq!(hits.get(), 0);

        assert!(obs.set(6));
        assert_eq!(obs.version(), 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn subscribers_notified_in_registration_order() {
        let obs = Observable::new(0);
        let order = Rc::new(RefCell::new(Vec::new()));
        let subs: Vec<_> = (0..3)
            .map(|i| {
                let o = Rc::clone(&order);
                obs.subscribe(move |_| o.borrow_mut().push(i))
            })
            .collect();
        obs.set(1);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn dropped_subscription_stops_notifications() {
        let obs = Observable::new(0);
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let sub = obs.subscribe(move |v| s.set(*v));
        obs.set(1);
        drop(sub);
        obs.set(2);
        assert_eq!(seen.get(), 1);
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[test]
    fn listener_may_write_back_into_the_cell() {
        let obs = Observable::new(0);
        let writer = obs.clone();
        let _sub = obs.subscribe(move |v| {
            if *v < 3 {
                writer.set(*v + 1);
            }
        });
        obs.set(1);
        assert_eq!(obs.get(), 3);
    }

    #[test]
    fn custom_equality_by_identity() {
        let first = Rc::new(String::from("same"));
        let obs = Observable::with_equality(
            Rc::clone(&first),
            Rc::new(|a: &Rc<String>, b: &Rc<String>| Rc::ptr_eq(a, b)),
        );
        assert!(obs.set(Rc::new(String::from("same"))), "new allocation is a change");
        let current = obs.get();
        assert!(!obs.set(current), "same pointer is not a change");
    }

    #[test]
    fn batch_coalesces_notifications() {
        let obs = Observable::new(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _sub = obs.subscribe(move |v| s.borrow_mut().push(*v));
        {
            let _batch = BatchScope::new();
            obs.set(1);
            obs.set(2);
            obs.set(3);
        }
        assert_eq!(*seen.borrow(), vec![3]);
        assert_eq!(obs.version(), 3);
    }

    #[test]
    fn clear_subscribers_detaches_everyone() {
        let obs = Observable::new(0);
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let _sub = obs.subscribe(move |_| h.set(h.get() + 1));
        obs.clear_subscribers();
        obs.set(9);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn update_derives_from_current() {
        let obs = Observable::new(2);
        obs.update(|v| v * 10);
        assert_eq!(obs.get(), 20);
    }

    proptest::proptest! {
        #[test]
        fn version_counts_changes_and_listener_sees_each(
            writes in proptest::collection::vec(0_u8..4, 0..50),
        ) {
            let obs = Observable::new(0_u8);
            let seen = Rc::new(RefCell::new(Vec::new()));
            let s = Rc::clone(&seen);
            let _sub = obs.subscribe(move |v| s.borrow_mut().push(*v));

            let mut expected = Vec::new();
            let mut current = 0;
            for w in writes {
                if w != current {
                    expected.push(w);
                    current = w;
                }
                obs.set(w);
            }
            proptest::prop_assert_eq!(obs.version(), expected.len() as u64);
            proptest::prop_assert_eq!(&*seen.borrow(), &expected);
        }
    }
}
