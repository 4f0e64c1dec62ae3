#![forbid(unsafe_code)]

//! The subscribable-value capability and its RAII subscription guard.
//!
//! [`Subscribable`] is the whole contract a binding layer needs from a keel
//! value: read the current value, and register a listener for changes. The
//! store engine depends only on this trait, never on a concrete cell type.

use std::any::Any;
use std::rc::{Rc, Weak};

/// Minimal capability interface for a value that can be read and observed.
///
/// Implemented by [`Observable`](crate::Observable) (pull-based cell),
/// [`EventStream`](crate::EventStream) (push-based stream) and
/// [`Selector`](crate::Selector) (derived value).
pub trait Subscribable<T> {
    /// Current value.
    fn get(&self) -> T;

    /// Register `listener`; it stays registered while the returned
    /// [`Subscription`] is alive.
    fn subscribe(&self, listener: Box<dyn Fn(&T)>) -> Subscription;
}

/// RAII guard for a registered listener.
///
/// The source only keeps a `Weak` reference to the listener; this guard owns
/// the strong one. Dropping the guard therefore unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    guard: Option<Box<dyn Any>>,
}

impl Subscription {
    pub(crate) fn new<T: 'static>(callback: Rc<dyn Fn(&T)>) -> Self {
        Self {
            guard: Some(Box::new(callback)),
        }
    }

    /// A subscription that is not attached to anything.
    ///
    /// Returned when subscribing to a source that can no longer emit (for
    /// example a destroyed store).
    pub fn detached() -> Self {
        Self { guard: None }
    }

    /// Whether this guard still holds a listener.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.guard.is_some()
    }

    /// Explicitly unsubscribe. Equivalent to dropping the guard.
    pub fn unsubscribe(mut self) {
        self.guard = None;
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.guard.is_some())
            .finish()
    }
}

/// Registration-ordered listener list shared by the concrete sources.
pub(crate) struct Listeners<T> {
    slots: Vec<Weak<dyn Fn(&T)>>,
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn add(&mut self, callback: Box<dyn Fn(&T)>) -> Subscription {
        let strong: Rc<dyn Fn(&T)> = Rc::from(callback);
        self.slots.push(Rc::downgrade(&strong));
        Subscription::new(strong)
    }

    /// Upgrade the live listeners, pruning dropped ones.
    ///
    /// The returned handles are invoked after the caller has released its
    /// borrow of the source, so listeners may touch the source freely.
    pub(crate) fn live(&mut self) -> Vec<Rc<dyn Fn(&T)>> {
        self.slots.retain(|w| w.strong_count() > 0);
        self.slots.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|w| w.strong_count() > 0).count()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}
