#![forbid(unsafe_code)]

//! Push-based event stream.
//!
//! Unlike [`Observable`](crate::Observable), an [`EventStream`] does not
//! deduplicate: every [`emit`](EventStream::emit) reaches every subscriber,
//! and inside a [`BatchScope`](crate::BatchScope) every emission is queued.
//! The last emitted value is retained so the stream can also be read.

use std::cell::RefCell;
use std::rc::Rc;

use crate::batch::defer_or_run;
use crate::subscribable::{Listeners, Subscribable, Subscription};

struct Inner<T> {
    last: T,
    emitted: u64,
    listeners: Listeners<T>,
}

/// A multicast stream that remembers its latest value.
pub struct EventStream<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> EventStream<T> {
    /// Create a stream whose `get()` returns `initial` until the first emission.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                last: initial,
                emitted: 0,
                listeners: Listeners::new(),
            })),
        }
    }

    /// Push `value` to every subscriber.
    pub fn emit(&self, value: T) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.last = value.clone();
            inner.emitted += 1;
        }
        let weak = Rc::downgrade(&self.inner);
        defer_or_run(None, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let callbacks = inner.borrow_mut().listeners.live();
            for callback in callbacks {
                callback(&value);
            }
        });
    }

    /// Latest emitted value (or the initial one).
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.borrow().last.clone()
    }

    /// Number of emissions so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.inner.borrow().emitted
    }

    /// Register a listener for future emissions.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        self.inner.borrow_mut().listeners.add(Box::new(callback))
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }
}

impl<T: Clone + 'static> Subscribable<T> for EventStream<T> {
    fn get(&self) -> T {
        EventStream::get(self)
    }

    fn subscribe(&self, listener: Box<dyn Fn(&T)>) -> Subscription {
        self.inner.borrow_mut().listeners.add(listener)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventStream")
            .field("last", &inner.last)
            .field("emitted", &inner.emitted)
            .finish()
    }
}
