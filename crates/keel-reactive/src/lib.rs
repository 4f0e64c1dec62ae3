#![forbid(unsafe_code)]

//! Reactive primitives for keel stores.
//!
//! This crate provides the "subscribable value" capability that the store
//! engine exposes to UI binding layers:
//!
//! - [`Subscribable`]: the minimal capability interface (`get` + `subscribe`).
//! - [`Observable`]: a pull-based, version-tracked cell. Setting a value equal
//!   to the current one is a no-op.
//! - [`EventStream`]: a push-based stream. Every emission reaches every
//!   subscriber, equal or not.
//! - [`Selector`]: a derived value projected from any [`Subscribable`],
//!   deduplicated by a comparator.
//! - [`Subscription`]: RAII guard that automatically unsubscribes on drop.
//! - [`BatchScope`]: RAII guard that defers notifications until the outermost
//!   scope exits.
//!
//! # Architecture
//!
//! Everything is single-threaded: values live in `Rc<RefCell<..>>` and
//! subscribers are stored as `Weak` callbacks that are cleaned up lazily
//! during notification.
//!
//! # Invariants
//!
//! 1. `Observable` versions increment exactly once per change.
//! 2. Subscribers are notified in registration order.
//! 3. Dropping a [`Subscription`] removes the callback before the next
//!    notification cycle.
//! 4. Callbacks never run while the source value is borrowed, so a callback
//!    may read or write the value it was notified about.
//! 5. Within a `BatchScope`, values update immediately but notifications are
//!    deferred until the outermost scope exits; an `Observable` changed several
//!    times inside one batch notifies once, with its final value.

pub mod batch;
pub mod observable;
pub mod selector;
pub mod stream;
pub mod subscribable;

pub use batch::BatchScope;
pub use observable::{Equality, Observable};
pub use selector::Selector;
pub use stream::EventStream;
pub use subscribable::{Subscribable, Subscription};
