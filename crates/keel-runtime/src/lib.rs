#![forbid(unsafe_code)]

//! Store runtime for keel.
//!
//! A [`Store`] holds one immutable state and routes every mutation through a
//! pipeline: dedup, vetoable plugin hooks, commit, persistence, time-travel
//! recording, after-hooks and a single deferred notification. Around that
//! entry point sit:
//!
//! - [`transaction`]: snapshot-based, all-or-nothing transactions (sync and
//!   async bodies).
//! - [`undo`]: bounded undo/redo stacks implemented as a plugin.
//! - [`scheduler`]: debounce, throttle and keyed batching of updates.
//! - [`time_travel`]: a bounded, diffable mutation log with jump-to-action.
//! - [`context`]: the explicit host context that owns shared backends, global
//!   plugins and teardown.
//!
//! # Example
//!
//! ```
//! use keel_runtime::{History, StoreConfig, StoreContext};
//!
//! let ctx = StoreContext::new();
//! let undo = ctx.undo_plugin::<u32>();
//! let counter = ctx
//!     .create_store(StoreConfig::<u32>::new("counter").plugin(undo.clone()), || 0)
//!     .unwrap();
//! let history = History::new(&counter, undo);
//!
//! counter.update("increment", |n| n + 1).unwrap();
//! assert!(history.undo().unwrap());
//! assert_eq!(*counter.state(), 0);
//! assert!(history.redo().unwrap());
//! assert_eq!(*counter.state(), 1);
//! ```
//!
//! # Threading
//!
//! Everything is single-threaded (`Rc`/`RefCell`, `!Send`). Mutations run to
//! completion synchronously; async transactions interleave only at `.await`
//! points chosen by the caller.

pub mod config;
pub mod context;
pub mod error;
pub mod plugin;
pub mod scheduler;
pub mod store;
pub mod time_travel;
pub mod transaction;
pub mod undo;

pub use config::{ConfigError, EngineConfig, PersistTo, StoreConfig};
pub use context::StoreContext;
pub use error::{Hook, PluginError, StoreError, TransactionError};
pub use plugin::{Decision, PluginContext, PluginPipeline, StorePlugin, TracingPlugin};
pub use scheduler::{BatchContext, BatchGuard, Debouncer, Throttler, merge_json};
pub use store::{INIT_ACTION, Outcome, Reason, State, Store, Update};
pub use time_travel::{HistoryEntry, TimeTravelCommand, TimeTravelRecorder};
pub use transaction::{ROLLBACK_ACTION, Transaction, TransactionState};
pub use undo::{History, UndoRedoPlugin};
