#![forbid(unsafe_code)]

//! Time-travel recording of store mutations.
//!
//! The [`TimeTravelRecorder`] keeps a bounded log of every recorded mutation
//! across the stores of a context. States are stored as JSON so one recorder
//! can hold stores of different state types.
//!
//! # Invariants
//!
//! 1. Entry ids increase monotonically and are never reused, even across
//!    [`clear`](TimeTravelRecorder::clear).
//! 2. The log never holds more than `capacity` entries; the oldest is evicted.
//! 3. While paused, `record` is a no-op. Mutations themselves are unaffected.
//! 4. Jumping to an entry applies its state straight to the store: no plugin,
//!    persistence or recording side effects. Subscribers are still notified.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | `UnknownAction` | id evicted or never recorded | jump returns error |
//! | `UnknownStore` | store destroyed or never registered | jump returns error |
//! | `Codec` | entry state no longer fits the store's type | jump returns error |

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use keel_core::StateDiff;
use keel_reactive::{EventStream, Subscription};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_RECORDING_CAPACITY;
use crate::error::StoreError;

/// Callback a store registers so the recorder can apply past states to it.
pub type JumpTarget = Box<dyn Fn(&Value) -> Result<(), StoreError>>;

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Increasing id, starting at 1. Saturates at `u64::MAX`.
    pub id: u64,
    /// Store that changed.
    pub store_name: String,
    /// Action label of the mutation.
    pub action: String,
    /// State after the mutation.
    pub state: Value,
    /// State before the mutation; absent for a store's first state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_state: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Inbound devtools commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeTravelCommand {
    /// Apply the state of the entry with this id.
    JumpToAction(u64),
    /// Stop recording.
    Pause,
    /// Resume recording.
    Resume,
    /// Drop every entry.
    Clear,
}

struct Log {
    entries: VecDeque<HistoryEntry>,
    next_id: u64,
    paused: bool,
}

struct RecorderInner {
    capacity: usize,
    log: RefCell<Log>,
    targets: RefCell<HashMap<String, Rc<JumpTarget>>>,
    events: EventStream<Option<HistoryEntry>>,
}

/// Shared, bounded mutation log. Clones share the same log.
#[derive(Clone)]
pub struct TimeTravelRecorder {
    inner: Rc<RecorderInner>,
}

impl Default for TimeTravelRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeTravelRecorder {
    /// Recorder with the default capacity of 100 entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RECORDING_CAPACITY)
    }

    /// Recorder keeping at most `capacity` entries.
    ///
    /// A `capacity` of zero is raised to one: the log always keeps the latest
    /// entry.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RecorderInner {
                capacity: capacity.max(1),
                log: RefCell::new(Log {
                    entries: VecDeque::new(),
                    next_id: 1,
                    paused: false,
                }),
                targets: RefCell::new(HashMap::new()),
                events: EventStream::new(None),
            }),
        }
    }

    /// Structural diff of two JSON states.
    #[must_use]
    pub fn diff(prev: &Value, next: &Value) -> Vec<StateDiff> {
        keel_core::diff(prev, next)
    }

    /// Maximum number of retained entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Append an entry unless paused.
    ///
    /// Returns whether the entry was recorded.
    pub fn record(
        &self,
        store_name: &str,
        action: &str,
        state: Value,
        prev_state: Option<Value>,
    ) -> bool {
        let entry = {
            let mut log = self.inner.log.borrow_mut();
            if log.paused {
                return false;
            }
            let entry = HistoryEntry {
                id: log.next_id,
                store_name: store_name.to_string(),
                action: action.to_string(),
                state,
                prev_state,
                timestamp: keel_core::epoch_millis(),
            };
            log.next_id = log.next_id.saturating_add(1);
            log.entries.push_back(entry.clone());
            while log.entries.len() > self.inner.capacity {
                log.entries.pop_front();
            }
            entry
        };
        tracing::trace!(id = entry.id, store = store_name, action, "recorded");
        self.inner.events.emit(Some(entry));
        true
    }

    /// Stop recording.
    pub fn pause(&self) {
        self.inner.log.borrow_mut().paused = true;
    }

    /// Resume recording.
    pub fn resume(&self) {
        self.inner.log.borrow_mut().paused = false;
    }

    /// Whether recording is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.log.borrow().paused
    }

    /// Drop every entry. Ids keep increasing afterwards.
    pub fn clear(&self) {
        self.inner.log.borrow_mut().entries.clear();
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.log.borrow().entries.len()
    }

    /// Whether no entry is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.inner.log.borrow().entries.iter().cloned().collect()
    }

    /// Retained entries of one store, oldest first.
    #[must_use]
    pub fn entries_for(&self, store_name: &str) -> Vec<HistoryEntry> {
        self.inner
            .log
            .borrow()
            .entries
            .iter()
            .filter(|e| e.store_name == store_name)
            .cloned()
            .collect()
    }

    /// Entry with `id`, if still retained.
    #[must_use]
    pub fn entry(&self, id: u64) -> Option<HistoryEntry> {
        self.inner
            .log
            .borrow()
            .entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Diff of the entry with `id` against its previous state.
    ///
    /// A store's first entry diffs against `null`.
    #[must_use]
    pub fn diff_entry(&self, id: u64) -> Option<Vec<StateDiff>> {
        let log = self.inner.log.borrow();
        let entry = log.entries.iter().find(|e| e.id == id)?;
        let prev = entry.prev_state.as_ref().unwrap_or(&Value::Null);
        Some(Self::diff(prev, &entry.state))
    }

    /// Register the callback applying states to `store_name`, replacing any
    /// previous one.
    pub fn register_target(&self, store_name: &str, target: JumpTarget) {
        self.inner
            .targets
            .borrow_mut()
            .insert(store_name.to_string(), Rc::new(target));
    }

    /// Remove the callback of `store_name`.
    pub fn unregister_target(&self, store_name: &str) -> bool {
        self.inner.targets.borrow_mut().remove(store_name).is_some()
    }

    /// Apply the state recorded in entry `id` to its store.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownAction`] if the entry is not retained,
    /// [`StoreError::UnknownStore`] if its store has no registered target, or
    /// whatever the target reports.
    pub fn jump_to_action(&self, id: u64) -> Result<(), StoreError> {
        let entry = self.entry(id).ok_or(StoreError::UnknownAction(id))?;
        let target = self
            .inner
            .targets
            .borrow()
            .get(&entry.store_name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownStore(entry.store_name.clone()))?;
        tracing::debug!(id, store = %entry.store_name, action = %entry.action, "jump_to_action");
        target(&entry.state)
    }

    /// Execute a devtools command.
    ///
    /// # Errors
    ///
    /// Only `JumpToAction` can fail; see [`jump_to_action`](Self::jump_to_action).
    pub fn dispatch(&self, command: TimeTravelCommand) -> Result<(), StoreError> {
        match command {
            TimeTravelCommand::JumpToAction(id) => self.jump_to_action(id),
            TimeTravelCommand::Pause => {
                self.pause();
                Ok(())
            }
            TimeTravelCommand::Resume => {
                self.resume();
                Ok(())
            }
            TimeTravelCommand::Clear => {
                self.clear();
                Ok(())
            }
        }
    }

    /// Listen to every newly recorded entry.
    pub fn subscribe(&self, listener: impl Fn(&HistoryEntry) + 'static) -> Subscription {
        self.inner.events.subscribe(move |event: &Option<HistoryEntry>| {
            if let Some(entry) = event {
                listener(entry);
            }
        })
    }

    /// Serialize the retained log as a JSON array.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        let log = self.inner.log.borrow();
        serde_json::to_string(&log.entries)
    }

    /// Replace the log with an exported one.
    ///
    /// Keeps the newest `capacity` entries and continues ids after the
    /// largest imported one. Ids saturate at `u64::MAX`. Returns the number
    /// of retained entries.
    ///
    /// # Errors
    ///
    /// Malformed input; the current log is left untouched.
    pub fn import_json(&self, raw: &str) -> Result<usize, serde_json::Error> {
        let mut imported: Vec<HistoryEntry> = serde_json::from_str(raw)?;
        imported.sort_by_key(|e| e.id);
        let skip = imported.len().saturating_sub(self.inner.capacity);
        let mut log = self.inner.log.borrow_mut();
        let max_id = imported.last().map_or(0, |e| e.id);
        log.entries = imported.into_iter().skip(skip).collect();
        log.next_id = log.next_id.max(max_id.saturating_add(1));
        Ok(log.entries.len())
    }
}

impl std::fmt::Debug for TimeTravelRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.inner.log.borrow();
        f.debug_struct("TimeTravelRecorder")
            .field("capacity", &self.inner.capacity)
            .field("entries", &log.entries.len())
            .field("next_id", &log.next_id)
            .field("paused", &log.paused)
            .field("targets", &self.inner.targets.borrow().len())
            .finish()
    }
}
