#![forbid(unsafe_code)]

//! Snapshot comparators.
//!
//! A comparator answers one question for the mutation pipeline: is the
//! candidate state observably equal to the current one? If it is, the
//! mutation is dropped before any plugin, persistence write or history entry.
//!
//! Comparators must be pure and symmetric.

use std::rc::Rc;

use serde::Serialize;

/// `(previous, candidate) -> equal?`
pub type Comparator<S> = Rc<dyn Fn(&S, &S) -> bool>;

/// Structural equality via `PartialEq`. The store default.
#[must_use]
pub fn structural<S: PartialEq + 'static>() -> Comparator<S> {
    Rc::new(|a: &S, b: &S| a == b)
}

/// Deep equality of the JSON projections.
///
/// Useful when `PartialEq` is stricter than the persisted form (for example
/// floating point fields that serialize identically, or skipped fields).
/// A value that fails to serialize never compares equal.
#[must_use]
pub fn json<S: Serialize + 'static>() -> Comparator<S> {
    Rc::new(|a: &S, b: &S| {
        match (serde_json::to_value(a), serde_json::to_value(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    })
}

/// Equality of a projection of the state.
///
/// Changes outside the projected part are treated as no-ops.
pub fn by_key<S: 'static, K: PartialEq>(key: impl Fn(&S) -> K + 'static) -> Comparator<S> {
    Rc::new(move |a: &S, b: &S| key(a) == key(b))
}

/// Never equal: every mutation commits (reference inequality only).
#[must_use]
pub fn never<S: 'static>() -> Comparator<S> {
    Rc::new(|_: &S, _: &S| false)
}
