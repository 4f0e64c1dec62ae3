#![forbid(unsafe_code)]

//! Undo/redo history as a store plugin.
//!
//! [`UndoRedoPlugin`] keeps bounded past/future stacks per store, fed by
//! after-change hooks. [`History`] binds the plugin to one store and applies
//! undo/redo steps through the normal mutation pipeline.
//!
//! # Pending requests
//!
//! `undo()` and `redo()` hand out a state and remember *which* `Rc` they
//! handed out. The next after-change for that store consumes the request:
//!
//! - if the committed state is that exact allocation, the change is the undo
//!   (or redo) step and the pre-change state moves to the opposite stack;
//! - otherwise some other mutation won the race: it is recorded as a fresh
//!   action and the request is dropped.
//!
//! While a request is pending, further `undo()`/`redo()` calls return `None`.
//! A request that will never be applied is returned to its stack with
//! [`abandon`](UndoRedoPlugin::abandon).
//!
//! # Invariants
//!
//! 1. `past.len() <= max_history`; the oldest entry is evicted first.
//! 2. A fresh (non-undo/redo) change clears the future stack.
//! 3. `can_undo`/`can_redo` observables always match the stack contents.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use keel_reactive::Observable;

use crate::config::DEFAULT_UNDO_MAX_HISTORY;
use crate::error::{PluginError, StoreError};
use crate::plugin::{PluginContext, StorePlugin};
use crate::store::{Outcome, Reason, State, Store, Update};

/// Action label of an applied undo step.
pub const UNDO_ACTION: &str = "@@undo";
/// Action label of an applied redo step.
pub const REDO_ACTION: &str = "@@redo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

struct Pending<S> {
    direction: Direction,
    state: Rc<S>,
}

struct Stacks<S> {
    past: VecDeque<Rc<S>>,
    future: Vec<Rc<S>>,
    pending: Option<Pending<S>>,
    can_undo: Observable<bool>,
    can_redo: Observable<bool>,
}

impl<S> Stacks<S> {
    fn new() -> Self {
        Self {
            past: VecDeque::new(),
            future: Vec::new(),
            pending: None,
            can_undo: Observable::new(false),
            can_redo: Observable::new(false),
        }
    }

    fn push_past(&mut self, state: Rc<S>, max_history: usize) {
        self.past.push_back(state);
        while self.past.len() > max_history {
            self.past.pop_front();
        }
    }

    fn flags(&self) -> Flags {
        Flags {
            can_undo: (self.can_undo.clone(), !self.past.is_empty()),
            can_redo: (self.can_redo.clone(), !self.future.is_empty()),
        }
    }
}

/// Observable updates computed under the stack borrow, applied after it.
struct Flags {
    can_undo: (Observable<bool>, bool),
    can_redo: (Observable<bool>, bool),
}

impl Flags {
    fn publish(self) {
        self.can_undo.0.set(self.can_undo.1);
        self.can_redo.0.set(self.can_redo.1);
    }
}

/// Plugin maintaining per-store undo/redo stacks.
pub struct UndoRedoPlugin<S> {
    max_history: usize,
    stacks: RefCell<HashMap<String, Stacks<S>>>,
}

impl<S> Default for UndoRedoPlugin<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> UndoRedoPlugin<S> {
    /// Plugin keeping the default 50 past states per store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_UNDO_MAX_HISTORY)
    }

    /// Plugin keeping at most `max_history` past states per store.
    ///
    /// A `max_history` of zero is raised to one, so the last change can
    /// always be undone.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            stacks: RefCell::new(HashMap::new()),
        }
    }

    /// Past stack bound.
    #[must_use]
    pub fn max_history(&self) -> usize {
        self.max_history
    }

    fn with_stacks<R>(&self, store: &str, f: impl FnOnce(&mut Stacks<S>) -> R) -> R {
        let (result, flags) = {
            let mut map = self.stacks.borrow_mut();
            let stacks = map.entry(store.to_string()).or_insert_with(Stacks::new);
            let result = f(stacks);
            (result, stacks.flags())
        };
        flags.publish();
        result
    }

    fn peek<R>(&self, store: &str, f: impl FnOnce(&Stacks<S>) -> R) -> Option<R> {
        self.stacks.borrow().get(store).map(f)
    }

    /// Take the state to restore for an undo of `store`.
    ///
    /// Returns `None` if there is nothing to undo or a request is pending.
    pub fn undo(&self, store: &str) -> Option<Rc<S>> {
        self.with_stacks(store, |stacks| {
            if stacks.pending.is_some() {
                return None;
            }
            let state = stacks.past.pop_back()?;
            stacks.pending = Some(Pending {
                direction: Direction::Undo,
                state: Rc::clone(&state),
            });
            Some(state)
        })
    }

    /// Take the state to restore for a redo of `store`.
    ///
    /// Returns `None` if there is nothing to redo or a request is pending.
    pub fn redo(&self, store: &str) -> Option<Rc<S>> {
        self.with_stacks(store, |stacks| {
            if stacks.pending.is_some() {
                return None;
            }
            let state = stacks.future.pop()?;
            stacks.pending = Some(Pending {
                direction: Direction::Redo,
                state: Rc::clone(&state),
            });
            Some(state)
        })
    }

    /// Put a pending, never-applied state back on the stack it came from.
    ///
    /// Returns whether a request was pending.
    pub fn abandon(&self, store: &str) -> bool {
        self.with_stacks(store, |stacks| match stacks.pending.take() {
            Some(Pending {
                direction: Direction::Undo,
                state,
            }) => {
                stacks.past.push_back(state);
                true
            }
            Some(Pending {
                direction: Direction::Redo,
                state,
            }) => {
                stacks.future.push(state);
                true
            }
            None => false,
        })
    }

    /// Drop a pending request without restoring it.
    pub(crate) fn discard_pending(&self, store: &str) -> bool {
        self.with_stacks(store, |stacks| stacks.pending.take().is_some())
    }

    /// Whether `store` has anything to undo.
    #[must_use]
    pub fn can_undo(&self, store: &str) -> bool {
        self.peek(store, |s| !s.past.is_empty()).unwrap_or(false)
    }

    /// Whether `store` has anything to redo.
    #[must_use]
    pub fn can_redo(&self, store: &str) -> bool {
        self.peek(store, |s| !s.future.is_empty()).unwrap_or(false)
    }

    /// Subscribable `can_undo` flag of `store`.
    pub fn can_undo_observable(&self, store: &str) -> Observable<bool> {
        self.with_stacks(store, |stacks| stacks.can_undo.clone())
    }

    /// Subscribable `can_redo` flag of `store`.
    pub fn can_redo_observable(&self, store: &str) -> Observable<bool> {
        self.with_stacks(store, |stacks| stacks.can_redo.clone())
    }

    /// Number of undoable states of `store`.
    #[must_use]
    pub fn past_len(&self, store: &str) -> usize {
        self.peek(store, |s| s.past.len()).unwrap_or(0)
    }

    /// Number of redoable states of `store`.
    #[must_use]
    pub fn future_len(&self, store: &str) -> usize {
        self.peek(store, |s| s.future.len()).unwrap_or(0)
    }

    /// Forget the history of `store`.
    pub fn clear(&self, store: &str) {
        self.with_stacks(store, |stacks| {
            stacks.past.clear();
            stacks.future.clear();
            stacks.pending = None;
        });
    }
}

impl<S> StorePlugin<S> for UndoRedoPlugin<S> {
    fn name(&self) -> &str {
        "undo-redo"
    }

    fn on_store_init(&self, store_name: &str, _initial: &Rc<S>) -> Result<(), PluginError> {
        self.with_stacks(store_name, |_| ());
        Ok(())
    }

    fn on_after_change(&self, ctx: &PluginContext<'_, S>) -> Result<(), PluginError> {
        let max_history = self.max_history;
        let prev = Rc::clone(ctx.prev_state);
        self.with_stacks(ctx.store_name, |stacks| match stacks.pending.take() {
            Some(pending) if Rc::ptr_eq(&pending.state, ctx.next_state) => {
                match pending.direction {
                    Direction::Undo => stacks.future.push(prev),
                    Direction::Redo => stacks.push_past(prev, max_history),
                }
            }
            _ => {
                stacks.push_past(prev, max_history);
                stacks.future.clear();
            }
        });
        Ok(())
    }

    fn on_store_destroy(&self, store_name: &str) -> Result<(), PluginError> {
        let removed = self.stacks.borrow_mut().remove(store_name);
        if let Some(stacks) = removed {
            stacks.can_undo.set(false);
            stacks.can_redo.set(false);
        }
        Ok(())
    }
}

impl<S> std::fmt::Debug for UndoRedoPlugin<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stacks = self.stacks.borrow();
        let mut sizes: Vec<_> = stacks
            .iter()
            .map(|(name, s)| (name.clone(), s.past.len(), s.future.len()))
            .collect();
        sizes.sort();
        f.debug_struct("UndoRedoPlugin")
            .field("max_history", &self.max_history)
            .field("stores", &sizes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Store-bound view
// ---------------------------------------------------------------------------

/// Undo/redo bound to one store.
///
/// The plugin must be registered on the store (per store or globally) for
/// history to be recorded.
pub struct History<S: State> {
    store: Store<S>,
    plugin: Rc<UndoRedoPlugin<S>>,
}

impl<S: State> Clone for History<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            plugin: Rc::clone(&self.plugin),
        }
    }
}

impl<S: State> History<S> {
    /// Bind `plugin` to `store`.
    pub fn new(store: &Store<S>, plugin: Rc<UndoRedoPlugin<S>>) -> Self {
        Self {
            store: store.clone(),
            plugin,
        }
    }

    /// Step back one change. Returns whether the state changed.
    ///
    /// # Errors
    ///
    /// Errors of the underlying mutation.
    pub fn undo(&self) -> Result<bool, StoreError> {
        match self.plugin.undo(self.store.name()) {
            Some(target) => self.apply(target, UNDO_ACTION),
            None => Ok(false),
        }
    }

    /// Step forward one undone change. Returns whether the state changed.
    ///
    /// # Errors
    ///
    /// Errors of the underlying mutation.
    pub fn redo(&self) -> Result<bool, StoreError> {
        match self.plugin.redo(self.store.name()) {
            Some(target) => self.apply(target, REDO_ACTION),
            None => Ok(false),
        }
    }

    fn apply(&self, target: Rc<S>, action: &str) -> Result<bool, StoreError> {
        let name = self.store.name();
        match self.store.mutate(Update::Restore(target), action) {
            Ok(Outcome::Committed(_)) => Ok(true),
            Ok(Outcome::NoChange(Reason::Equal)) => {
                self.plugin.discard_pending(name);
                Ok(false)
            }
            Ok(Outcome::NoChange(Reason::Vetoed { .. })) => {
                self.plugin.abandon(name);
                Ok(false)
            }
            Err(err) => {
                // A no-op when the change committed before the error.
                self.plugin.abandon(name);
                Err(err)
            }
        }
    }

    /// Whether there is anything to undo.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.plugin.can_undo(self.store.name())
    }

    /// Whether there is anything to redo.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.plugin.can_redo(self.store.name())
    }

    /// Subscribable `can_undo` flag.
    pub fn can_undo_observable(&self) -> Observable<bool> {
        self.plugin.can_undo_observable(self.store.name())
    }

    /// Subscribable `can_redo` flag.
    pub fn can_redo_observable(&self) -> Observable<bool> {
        self.plugin.can_redo_observable(self.store.name())
    }

    /// Forget this store's history.
    pub fn clear(&self) {
        self.plugin.clear(self.store.name());
    }

    /// Bound store.
    #[must_use]
    pub fn store(&self) -> &Store<S> {
        &self.store
    }
}

impl<S: State> std::fmt::Debug for History<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("store", &self.store.name())
            .field("past", &self.plugin.past_len(self.store.name()))
            .field("future", &self.plugin.future_len(self.store.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(plugin: &UndoRedoPlugin<u32>, prev: &Rc<u32>, next: &Rc<u32>) {
        let ctx = PluginContext {
            store_name: "counter",
            action: "set",
            prev_state: prev,
            next_state: next,
            timestamp: 0,
        };
        plugin.on_after_change(&ctx).unwrap();
    }

    #[test]
    fn undo_hands_out_previous_state_once() {
        let plugin = UndoRedoPlugin::new();
        let (zero, one) = (Rc::new(0), Rc::new(1));
        change(&plugin, &zero, &one);

        let target = plugin.undo("counter").unwrap();
        assert!(Rc::ptr_eq(&target, &zero));
        assert!(plugin.undo("counter").is_none(), "request still pending");

        change(&plugin, &one, &target);
        assert_eq!(plugin.past_len("counter"), 0);
        assert_eq!(plugin.future_len("counter"), 1);
    }

    #[test]
    fn foreign_change_drops_pending_request() {
        let plugin = UndoRedoPlugin::new();
        let (zero, one, other) = (Rc::new(0), Rc::new(1), Rc::new(9));
        change(&plugin, &zero, &one);
        let _target = plugin.undo("counter").unwrap();

        change(&plugin, &one, &other);
        assert_eq!(plugin.past_len("counter"), 1);
        assert_eq!(plugin.future_len("counter"), 0);
        assert!(plugin.undo("counter").is_some());
    }

    #[test]
    fn abandon_restores_stack() {
        let plugin = UndoRedoPlugin::new();
        let (zero, one) = (Rc::new(0), Rc::new(1));
        change(&plugin, &zero, &one);
        plugin.undo("counter").unwrap();
        assert!(!plugin.can_undo("counter"));
        assert!(plugin.abandon("counter"));
        assert!(plugin.can_undo("counter"));
        assert!(!plugin.abandon("counter"));
    }

    #[test]
    fn past_is_bounded() {
        let plugin = UndoRedoPlugin::with_max_history(3);
        let states: Vec<_> = (0..10).map(Rc::new).collect();
        for pair in states.windows(2) {
            change(&plugin, &pair[0], &pair[1]);
        }
        assert_eq!(plugin.past_len("counter"), 3);
        assert_eq!(*plugin.undo("counter").unwrap(), 8);
    }

    #[test]
    fn zero_max_history_keeps_one_state() {
        let plugin = UndoRedoPlugin::with_max_history(0);
        assert_eq!(plugin.max_history(), 1);
        let states: Vec<_> = (0..3).map(Rc::new).collect();
        for pair in states.windows(2) {
            change(&plugin, &pair[0], &pair[1]);
        }
        assert_eq!(plugin.past_len("counter"), 1);
    }

    #[test]
    fn observables_follow_stacks() {
        let plugin = UndoRedoPlugin::new();
        let can_undo = plugin.can_undo_observable("counter");
        let can_redo = plugin.can_redo_observable("counter");
        let (zero, one) = (Rc::new(0), Rc::new(1));

        change(&plugin, &zero, &one);
        assert!(can_undo.get());
        let target = plugin.undo("counter").unwrap();
        change(&plugin, &one, &target);
        assert!(!can_undo.get());
        assert!(can_redo.get());

        plugin.clear("counter");
        assert!(!can_redo.get());
    }

    #[test]
    fn destroy_drops_store_stacks() {
        let plugin = UndoRedoPlugin::new();
        change(&plugin, &Rc::new(0), &Rc::new(1));
        plugin.on_store_destroy("counter").unwrap();
        assert_eq!(plugin.past_len("counter"), 0);
    }
}
