#![forbid(unsafe_code)]

//! keel: a reactive, mutation-mediated state container engine.
//!
//! This crate re-exports the workspace crates under one roof:
//!
//! | Module | Crate | Contents |
//! |--------|-------|----------|
//! | [`core`] | `keel-core` | comparators, diffing, persistence, clocks |
//! | [`reactive`] | `keel-reactive` | subscribable values, selectors, batching |
//! | [`runtime`] | `keel-runtime` | stores, plugins, transactions, undo, schedulers, time travel |
//!
//! Most applications only need the [`prelude`].
//!
//! ```
//! use keel::prelude::*;
//!
//! #[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Cart {
//!     items: Vec<String>,
//! }
//!
//! let ctx = StoreContext::new();
//! let cart = ctx
//!     .create_store(StoreConfig::new("cart"), || Cart { items: vec![] })
//!     .unwrap();
//! let count = cart.select(|c: &Cart| c.items.len());
//!
//! cart.patch("addItem", |c| c.items.push("apple".into())).unwrap();
//! assert_eq!(count.get(), 1);
//! ```

pub use keel_core as core;
pub use keel_reactive as reactive;
pub use keel_runtime as runtime;

pub use keel_runtime::{
    Outcome, Reason, State, Store, StoreConfig, StoreContext, StoreError, Update,
};

/// Everything needed to define, mutate and observe stores.
pub mod prelude {
    pub use keel_core::{
        Clock, DiffKind, FileStorage, FnCodec, JsonCodec, ManualClock, MemoryStorage, StateDiff,
        StorageBackend, SystemClock,
    };
    pub use keel_reactive::{BatchScope, EventStream, Observable, Selector, Subscribable, Subscription};
    pub use keel_runtime::{
        BatchContext, ConfigError, Debouncer, Decision, EngineConfig, History, HistoryEntry,
        Outcome, PersistTo, PluginContext, PluginError, Reason, State, Store, StoreConfig,
        StoreContext, StoreError, StorePlugin, Throttler, TimeTravelCommand, TimeTravelRecorder,
        TracingPlugin, Transaction, TransactionError, TransactionState, UndoRedoPlugin, Update,
    };
    pub use serde_json::{Value, json};
}
