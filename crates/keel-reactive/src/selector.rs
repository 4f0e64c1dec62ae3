#![forbid(unsafe_code)]

//! Derived values projected from a [`Subscribable`] source.
//!
//! A [`Selector`] keeps a projection of its source up to date and only
//! notifies its own subscribers when the projected value changes according to
//! its comparator. Selecting `count` out of a larger state therefore does not
//! wake `count` listeners when an unrelated field changes.

use std::rc::Rc;

use crate::observable::{Equality, Observable};
use crate::subscribable::{Subscribable, Subscription};

/// A derived, deduplicated view of another subscribable value.
///
/// Clones share the projection and the upstream subscription; the upstream
/// subscription is released when the last clone is dropped.
pub struct Selector<K> {
    cell: Observable<K>,
    _upstream: Rc<Subscription>,
}

impl<K> Clone for Selector<K> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _upstream: Rc::clone(&self._upstream),
        }
    }
}

impl<K: Clone + PartialEq + 'static> Selector<K> {
    /// Project `source` through `projector`, deduplicating with `PartialEq`.
    pub fn new<S, Src>(source: &Src, projector: impl Fn(&S) -> K + 'static) -> Self
    where
        S: 'static,
        Src: Subscribable<S> + ?Sized,
    {
        Self::with_equality(source, projector, Rc::new(|a: &K, b: &K| a == b))
    }
}

impl<K: Clone + 'static> Selector<K> {
    /// Project `source` through `projector`, deduplicating with `equals`.
    pub fn with_equality<S, Src>(
        source: &Src,
        projector: impl Fn(&S) -> K + 'static,
        equals: Equality<K>,
    ) -> Self
    where
        S: 'static,
        Src: Subscribable<S> + ?Sized,
    {
        let cell = Observable::with_equality(projector(&source.get()), equals);
        let target = cell.clone();
        let upstream = source.subscribe(Box::new(move |value: &S| {
            target.set(projector(value));
        }));
        Self {
            cell,
            _upstream: Rc::new(upstream),
        }
    }

    /// Current projected value.
    #[must_use]
    pub fn get(&self) -> K {
        self.cell.get()
    }

    /// Register a listener for projected changes.
    pub fn subscribe(&self, callback: impl Fn(&K) + 'static) -> Subscription {
        self.cell.subscribe(callback)
    }

    /// Number of projected changes observed.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.cell.version()
    }
}

impl<K: Clone + 'static> Subscribable<K> for Selector<K> {
    fn get(&self) -> K {
        Selector::get(self)
    }

    fn subscribe(&self, listener: Box<dyn Fn(&K)>) -> Subscription {
        Subscribable::subscribe(&self.cell, listener)
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for Selector<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector").field("cell", &self.cell).finish()
    }
}
