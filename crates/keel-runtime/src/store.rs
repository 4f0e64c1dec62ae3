#![forbid(unsafe_code)]

//! The state container and its mutation pipeline.
//!
//! A [`Store`] holds one immutable state behind an `Rc`. Every write goes
//! through [`Store::mutate`]:
//!
//! 1. destroyed / reentrancy checks
//! 2. resolve the [`Update`] against the current state
//! 3. dedup: pointer-equal or comparator-equal candidates are dropped
//! 4. before-hooks (vetoable)
//! 5. commit
//! 6. persist
//! 7. record into the time-travel log
//! 8. after-hooks
//! 9. notify subscribers, once, when the outermost batch scope closes
//!
//! # Invariants
//!
//! 1. [`Store::state`] returns the same `Rc` until the next commit.
//! 2. A deduplicated or vetoed mutation has no side effects at all.
//! 3. Subscribers never observe a state that is not committed, and are
//!    notified at most once per mutation.
//! 4. A hook that mutates the store it is attached to gets
//!    [`StoreError::Reentrant`]; subscribers may mutate freely.
//!
//! # Failure Modes
//!
//! | Failure | Stage | Committed? |
//! |---------|-------|------------|
//! | `Codec` | resolve (merge) | no |
//! | `Plugin` | before-hook | no |
//! | `Persistence` | persist | yes |
//! | `Plugin` | after-hook | yes |

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use keel_core::{Comparator, PersistenceAdapter, StateCodec};
use keel_reactive::{BatchScope, Observable, Selector, Subscribable, Subscription};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StoreError;
use crate::plugin::{PluginContext, PluginPipeline};
use crate::scheduler::{BatchContext, Debouncer, Throttler, merge_json};
use crate::time_travel::{JumpTarget, TimeTravelRecorder};

/// Action label of a store's first state in the time-travel log.
pub const INIT_ACTION: &str = "@@INIT";

/// Bound satisfied by every value a store can hold.
pub trait State: Clone + PartialEq + Serialize + DeserializeOwned + 'static {}

impl<T> State for T where T: Clone + PartialEq + Serialize + DeserializeOwned + 'static {}

/// How to derive the next state.
pub enum Update<'a, S> {
    /// Use this value.
    Replace(S),
    /// Use this exact allocation. Restoring the current `Rc` is a no-op.
    Restore(Rc<S>),
    /// Compute the next state from the current one.
    Compute(Box<dyn FnOnce(&S) -> S + 'a>),
    /// Edit a clone of the current state in place.
    Draft(Box<dyn FnOnce(&mut S) + 'a>),
    /// Shallow-merge a JSON object into the state's JSON form.
    Merge(Value),
    /// Compute a JSON partial from the current state, then merge it.
    MergeWith(Box<dyn FnOnce(&S) -> Value + 'a>),
}

impl<'a, S> Update<'a, S> {
    /// [`Update::Compute`] from a closure.
    pub fn compute(f: impl FnOnce(&S) -> S + 'a) -> Self {
        Self::Compute(Box::new(f))
    }

    /// [`Update::Draft`] from a closure.
    pub fn draft(f: impl FnOnce(&mut S) + 'a) -> Self {
        Self::Draft(Box::new(f))
    }

    /// [`Update::MergeWith`] from a closure.
    pub fn merge_with(f: impl FnOnce(&S) -> Value + 'a) -> Self {
        Self::MergeWith(Box::new(f))
    }
}

impl<S> fmt::Debug for Update<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace(_) => f.write_str("Replace(..)"),
            Self::Restore(_) => f.write_str("Restore(..)"),
            Self::Compute(_) => f.write_str("Compute(..)"),
            Self::Draft(_) => f.write_str("Draft(..)"),
            Self::Merge(partial) => write!(f, "Merge({partial})"),
            Self::MergeWith(_) => f.write_str("MergeWith(..)"),
        }
    }
}

/// Why a mutation left the state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// The candidate equals the current state.
    Equal,
    /// A before-hook vetoed the change.
    Vetoed {
        /// Name of the vetoing plugin.
        plugin: String,
    },
}

/// Result of a successful [`Store::mutate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<S> {
    /// The state changed to this value.
    Committed(Rc<S>),
    /// Nothing happened.
    NoChange(Reason),
}

impl<S> Outcome<S> {
    /// Whether the state changed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Committed state, if any.
    #[must_use]
    pub fn committed(&self) -> Option<&Rc<S>> {
        match self {
            Self::Committed(state) => Some(state),
            Self::NoChange(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store internals
// ---------------------------------------------------------------------------

pub(crate) struct StoreParts<S> {
    pub(crate) name: String,
    pub(crate) comparator: Comparator<S>,
    pub(crate) plugins: PluginPipeline<S>,
    pub(crate) persistence: Option<PersistenceAdapter>,
    pub(crate) codec: Rc<dyn StateCodec<S>>,
    pub(crate) recorder: TimeTravelRecorder,
    pub(crate) recording: bool,
    pub(crate) initial: Box<dyn Fn() -> S>,
}

struct StoreInner<S> {
    name: String,
    cell: Observable<Rc<S>>,
    comparator: Comparator<S>,
    plugins: PluginPipeline<S>,
    persistence: Option<PersistenceAdapter>,
    codec: Rc<dyn StateCodec<S>>,
    recorder: TimeTravelRecorder,
    recording: bool,
    initial: Box<dyn Fn() -> S>,
    in_flight: Cell<bool>,
    destroyed: Cell<bool>,
}

/// Marks the pipeline as running; cleared on drop, including unwinding.
struct InFlight<'a>(&'a Cell<bool>);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// First state of a store: the persisted one if readable, else a fresh one.
fn load_first_state<S>(
    name: &str,
    persistence: Option<&PersistenceAdapter>,
    codec: &dyn StateCodec<S>,
    initial: &dyn Fn() -> S,
) -> S {
    let Some(adapter) = persistence else {
        return initial();
    };
    match adapter.read(name, codec) {
        Ok(Some(state)) => {
            tracing::debug!(store = name, key = %adapter.key_for(name), "state restored");
            state
        }
        Ok(None) => initial(),
        Err(err) => {
            tracing::warn!(
                store = name,
                key = %adapter.key_for(name),
                error = %err,
                "persisted state unusable, using initial state"
            );
            initial()
        }
    }
}

impl<S: State> StoreInner<S> {
    fn codec_error(&self, err: &serde_json::Error) -> StoreError {
        StoreError::Codec {
            store: self.name.clone(),
            message: err.to_string(),
        }
    }

    fn merged(&self, current: &S, partial: Value) -> Result<S, StoreError> {
        let base = serde_json::to_value(current).map_err(|e| self.codec_error(&e))?;
        let next = merge_json(base, partial);
        serde_json::from_value(next).map_err(|e| self.codec_error(&e))
    }

    fn resolve(&self, update: Update<'_, S>, current: &Rc<S>) -> Result<Rc<S>, StoreError> {
        Ok(match update {
            Update::Replace(next) => Rc::new(next),
            Update::Restore(next) => next,
            Update::Compute(f) => Rc::new(f(current)),
            Update::Draft(f) => {
                let mut draft = S::clone(current);
                f(&mut draft);
                Rc::new(draft)
            }
            Update::Merge(partial) => Rc::new(self.merged(current, partial)?),
            Update::MergeWith(f) => {
                let partial = f(current);
                Rc::new(self.merged(current, partial)?)
            }
        })
    }

    fn persist(&self, state: &S) -> Result<(), StoreError> {
        match &self.persistence {
            Some(adapter) => adapter
                .write(&self.name, state, self.codec.as_ref())
                .map_err(|source| StoreError::Persistence {
                    store: self.name.clone(),
                    source,
                }),
            None => Ok(()),
        }
    }

    fn record(&self, action: &str, state: &S, prev: Option<&S>) {
        if !self.recording {
            return;
        }
        let projected = serde_json::to_value(state).and_then(|next| {
            prev.map(serde_json::to_value)
                .transpose()
                .map(|prev| (next, prev))
        });
        match projected {
            Ok((next, prev)) => {
                self.recorder.record(&self.name, action, next, prev);
            }
            Err(err) => {
                tracing::warn!(store = %self.name, action, error = %err, "state not recorded");
            }
        }
    }

    fn jump(&self, value: &Value) -> Result<(), StoreError> {
        if self.destroyed.get() {
            return Err(StoreError::UnknownStore(self.name.clone()));
        }
        if self.in_flight.get() {
            return Err(StoreError::Reentrant {
                store: self.name.clone(),
                action: "@@jump".to_string(),
            });
        }
        let state: S = serde_json::from_value(value.clone()).map_err(|e| self.codec_error(&e))?;
        let _batch = BatchScope::new();
        self.cell.set(Rc::new(state));
        Ok(())
    }

    fn destroy(&self) -> Result<(), StoreError> {
        if self.destroyed.replace(true) {
            return Ok(());
        }
        self.recorder.unregister_target(&self.name);
        self.cell.clear_subscribers();
        tracing::debug!(store = %self.name, "store destroyed");
        self.plugins.destroy(&self.name)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// A named state container. Clones share the same store.
///
/// ```
/// use keel_runtime::{Store, StoreConfig, Update};
///
/// let counter = Store::new(StoreConfig::new("counter"), || 0_u32).unwrap();
/// counter.update("increment", |n| n + 1).unwrap();
/// assert_eq!(*counter.state(), 1);
///
/// // Writing an equal value is not a change.
/// let outcome = counter.set("noop", 1).unwrap();
/// assert!(!outcome.is_committed());
/// ```
pub struct Store<S> {
    inner: Rc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: State> Store<S> {
    /// Create a standalone store with a fresh default [`StoreContext`].
    ///
    /// # Errors
    ///
    /// See [`StoreContext::create_store`].
    ///
    /// [`StoreContext`]: crate::context::StoreContext
    /// [`StoreContext::create_store`]: crate::context::StoreContext::create_store
    pub fn new(
        config: crate::config::StoreConfig<S>,
        initial: impl Fn() -> S + 'static,
    ) -> Result<Self, StoreError> {
        crate::context::StoreContext::new().create_store(config, initial)
    }

    /// Build the store, resolve its first state and log it. Plugins are not
    /// initialized here.
    pub(crate) fn assemble(parts: StoreParts<S>) -> Self {
        let StoreParts {
            name,
            comparator,
            plugins,
            persistence,
            codec,
            recorder,
            recording,
            initial,
        } = parts;
        let first = load_first_state(&name, persistence.as_ref(), codec.as_ref(), &*initial);
        let inner = StoreInner {
            name,
            cell: Observable::with_equality(
                Rc::new(first),
                Rc::new(|a: &Rc<S>, b: &Rc<S>| Rc::ptr_eq(a, b)),
            ),
            comparator,
            plugins,
            persistence,
            codec,
            recorder,
            recording,
            initial,
            in_flight: Cell::new(false),
            destroyed: Cell::new(false),
        };
        let store = Self {
            inner: Rc::new(inner),
        };
        let first = store.state();
        store.inner.record(INIT_ACTION, &first, None);
        store
    }

    pub(crate) fn plugin_pipeline(&self) -> &PluginPipeline<S> {
        &self.inner.plugins
    }

    pub(crate) fn downgrade(&self) -> WeakStore<S> {
        WeakStore(Rc::downgrade(&self.inner))
    }

    /// Callback applying recorded states to this store without side effects.
    pub(crate) fn jump_target(&self) -> JumpTarget {
        let weak = Rc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        Box::new(move |value| match weak.upgrade() {
            Some(inner) => inner.jump(value),
            None => Err(StoreError::UnknownStore(name.clone())),
        })
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state. The same `Rc` is returned until the next commit.
    #[must_use]
    pub fn state(&self) -> Rc<S> {
        self.inner.cell.get()
    }

    /// Number of state changes since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.cell.version()
    }

    /// Whether [`destroy`](Self::destroy) has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Names of the plugins attached to this store, in invocation order.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.plugins.names()
    }

    /// Run one mutation through the pipeline.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Destroyed`] / [`StoreError::Reentrant`]: nothing ran.
    /// - [`StoreError::Codec`]: a merge could not be converted; nothing ran.
    /// - [`StoreError::Plugin`] from a before-hook: the change was aborted.
    /// - [`StoreError::Persistence`] or [`StoreError::Plugin`] from an
    ///   after-hook: the change is committed and every hook ran.
    pub fn mutate(&self, update: Update<'_, S>, action: &str) -> Result<Outcome<S>, StoreError> {
        let inner = &*self.inner;
        if inner.destroyed.get() {
            return Err(StoreError::Destroyed(inner.name.clone()));
        }
        if inner.in_flight.get() {
            return Err(StoreError::Reentrant {
                store: inner.name.clone(),
                action: action.to_string(),
            });
        }

        let _span = tracing::debug_span!("store_mutate", store = %inner.name, action).entered();
        // Declared before the in-flight guard so notifications flush after it clears.
        let _batch = BatchScope::new();
        let _in_flight = InFlight::enter(&inner.in_flight);

        let prev = inner.cell.get();
        let next = inner.resolve(update, &prev)?;
        if Rc::ptr_eq(&prev, &next) || (inner.comparator)(&prev, &next) {
            tracing::trace!("mutation deduplicated");
            return Ok(Outcome::NoChange(Reason::Equal));
        }

        let ctx = PluginContext {
            store_name: &inner.name,
            action,
            prev_state: &prev,
            next_state: &next,
            timestamp: keel_core::epoch_millis(),
        };
        if let Some(plugin) = inner.plugins.before(&ctx)? {
            tracing::debug!(%plugin, "mutation vetoed");
            return Ok(Outcome::NoChange(Reason::Vetoed { plugin }));
        }

        inner.cell.set(Rc::clone(&next));
        let persisted = inner.persist(&next);
        inner.record(action, &next, Some(&prev));
        let after = inner.plugins.after(&ctx);
        tracing::debug!(version = inner.cell.version(), "committed");

        persisted?;
        after?;
        Ok(Outcome::Committed(next))
    }

    /// Replace the state with `next`.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn set(&self, action: &str, next: S) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::Replace(next), action)
    }

    /// Compute the next state from the current one.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn update(&self, action: &str, f: impl FnOnce(&S) -> S) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::compute(f), action)
    }

    /// Edit a draft copy of the current state.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn patch(&self, action: &str, f: impl FnOnce(&mut S)) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::draft(f), action)
    }

    /// Shallow-merge a JSON object into the state.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn merge(&self, action: &str, partial: Value) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::Merge(partial), action)
    }

    /// Replace the state with a fresh value from the initial-state factory.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn reset(&self, action: &str) -> Result<Outcome<S>, StoreError> {
        let fresh = (self.inner.initial)();
        self.mutate(Update::Replace(fresh), action)
    }

    /// Delete this store's persisted state. The in-memory state is untouched.
    ///
    /// # Errors
    ///
    /// [`StoreError::Persistence`] on backend failure.
    pub fn clear_persisted(&self) -> Result<(), StoreError> {
        match &self.inner.persistence {
            Some(adapter) => {
                adapter
                    .remove(&self.inner.name)
                    .map_err(|source| StoreError::Persistence {
                        store: self.inner.name.clone(),
                        source,
                    })
            }
            None => Ok(()),
        }
    }

    /// Tear the store down: release subscribers, unregister from time
    /// travel and notify plugins. Idempotent.
    ///
    /// Persisted state is left in place.
    ///
    /// # Errors
    ///
    /// The first failing `on_store_destroy` hook; every hook still runs.
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.inner.destroy()
    }

    /// Listen to committed states.
    pub fn subscribe(&self, listener: impl Fn(&Rc<S>) + 'static) -> Subscription {
        self.inner.cell.subscribe(listener)
    }

    /// Derived value of the state, deduplicated with `PartialEq`.
    pub fn select<K>(&self, projector: impl Fn(&S) -> K + 'static) -> Selector<K>
    where
        K: Clone + PartialEq + 'static,
    {
        Selector::new(self, move |state: &Rc<S>| projector(state))
    }

    /// Derived value of the state, deduplicated with `equals`.
    pub fn select_with<K>(
        &self,
        projector: impl Fn(&S) -> K + 'static,
        equals: impl Fn(&K, &K) -> bool + 'static,
    ) -> Selector<K>
    where
        K: Clone + 'static,
    {
        Selector::with_equality(self, move |state: &Rc<S>| projector(state), Rc::new(equals))
    }

    /// Debouncer merging JSON partials into this store under `action`.
    pub fn debounced(
        &self,
        action: &str,
        delay: Duration,
    ) -> Debouncer<Value, Result<Outcome<S>, StoreError>> {
        let store = self.clone();
        let action = action.to_string();
        Debouncer::new(delay, move |partial: Value| store.merge(&action, partial))
            .with_merge(merge_json)
    }

    /// Throttler merging JSON partials into this store under `action`.
    pub fn throttled(
        &self,
        action: &str,
        delay: Duration,
    ) -> Throttler<Value, Result<Outcome<S>, StoreError>> {
        let store = self.clone();
        let action = action.to_string();
        Throttler::new(delay, move |partial: Value| store.merge(&action, partial))
    }

    /// Apply `update` when `batch` ends, coalesced with other updates to this
    /// store under the same action. Runs now when no batch is open.
    ///
    /// Failures are logged, since nothing is waiting for the result.
    pub fn schedule_in(&self, batch: &BatchContext, action: &str, update: Update<'static, S>) {
        let store = self.clone();
        let action_name = action.to_string();
        batch.schedule(format!("{}::{action}", self.inner.name), move || {
            if let Err(err) = store.mutate(update, &action_name) {
                tracing::warn!(store = %store.name(), action = %action_name, error = %err, "scheduled update failed");
            }
        });
    }
}

impl<S: State> Subscribable<Rc<S>> for Store<S> {
    fn get(&self) -> Rc<S> {
        self.state()
    }

    fn subscribe(&self, callback: Box<dyn Fn(&Rc<S>)>) -> Subscription {
        self.inner.cell.subscribe(callback)
    }
}

impl<S: State + fmt::Debug> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &*self.inner;
        f.debug_struct("Store")
            .field("name", &inner.name)
            .field("state", &inner.cell.get())
            .field("version", &inner.cell.version())
            .field("plugins", &inner.plugins)
            .field("persisted", &inner.persistence.is_some())
            .field("recording", &inner.recording)
            .field("destroyed", &inner.destroyed.get())
            .finish()
    }
}

/// A store as seen by the context's teardown registry.
pub(crate) trait RegisteredStore {
    fn name(&self) -> Option<String>;
    fn is_live(&self) -> bool;
    fn destroy(&self) -> Result<(), StoreError>;
}

/// Non-owning handle; the registry must not keep stores alive.
pub(crate) struct WeakStore<S>(Weak<StoreInner<S>>);

impl<S: State> RegisteredStore for WeakStore<S> {
    fn name(&self) -> Option<String> {
        self.0.upgrade().map(|inner| inner.name.clone())
    }

    fn is_live(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|inner| !inner.destroyed.get())
    }

    fn destroy(&self) -> Result<(), StoreError> {
        match self.0.upgrade() {
            Some(inner) => inner.destroy(),
            None => Ok(()),
        }
    }
}
