#![forbid(unsafe_code)]

//! Error types for the store runtime.
//!
//! A vetoed or deduplicated mutation is *not* an error; it is reported as
//! [`Outcome::NoChange`](crate::store::Outcome::NoChange). Everything here is
//! surfaced synchronously to the immediate caller. The only automatic
//! recovery is transactional rollback.

use std::fmt;

use keel_core::PersistenceError;

use crate::transaction::TransactionState;

/// Plugin lifecycle hook names, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// `on_store_init`
    Init,
    /// `on_before_change`
    BeforeChange,
    /// `on_after_change`
    AfterChange,
    /// `on_store_destroy`
    Destroy,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "on_store_init",
            Self::BeforeChange => "on_before_change",
            Self::AfterChange => "on_after_change",
            Self::Destroy => "on_store_destroy",
        })
    }
}

/// A plugin hook failed.
///
/// Plugins build one with [`PluginError::new`]; the pipeline fills in which
/// plugin and hook it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginError {
    /// Plugin name, as reported by `StorePlugin::name`.
    pub plugin: String,
    /// Hook that failed.
    pub hook: Option<Hook>,
    /// Human readable reason.
    pub message: String,
}

impl PluginError {
    /// A plugin failure with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            plugin: String::new(),
            hook: None,
            message: message.into(),
        }
    }

    pub(crate) fn located(mut self, plugin: &str, hook: Hook) -> Self {
        if self.plugin.is_empty() {
            self.plugin = plugin.to_string();
        }
        self.hook = Some(hook);
        self
    }
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hook {
            Some(hook) => write!(f, "plugin '{}' failed in {hook}: {}", self.plugin, self.message),
            None => write!(f, "plugin '{}' failed: {}", self.plugin, self.message),
        }
    }
}

impl std::error::Error for PluginError {}

/// Errors from store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The store configuration is unusable (for example an empty name).
    InvalidConfig(String),
    /// A live store with this name already exists in the context.
    DuplicateStore(String),
    /// The store has been destroyed.
    Destroyed(String),
    /// A mutation was issued from inside the same store's pipeline.
    Reentrant {
        /// Store being mutated.
        store: String,
        /// Action of the rejected nested mutation.
        action: String,
    },
    /// `commit()`/`rollback()` (or a mutation through a transaction handle)
    /// outside the `Active` state.
    InvalidTransactionState {
        /// State the operation requires.
        expected: TransactionState,
        /// State the transaction is in.
        actual: TransactionState,
    },
    /// Persisting a committed state failed. The in-memory state stays committed.
    Persistence {
        /// Store whose state was being written.
        store: String,
        /// Underlying failure.
        source: PersistenceError,
    },
    /// A plugin hook failed.
    Plugin(PluginError),
    /// A merge or time-travel payload could not be converted to the state type.
    Codec {
        /// Store involved.
        store: String,
        /// Conversion error.
        message: String,
    },
    /// A plugin vetoed the restore of a rollback. The transaction is over but
    /// the store still holds the in-transaction state.
    RollbackVetoed {
        /// Store being rolled back.
        store: String,
        /// Plugin that vetoed.
        plugin: String,
    },
    /// No history entry has this id.
    UnknownAction(u64),
    /// No live store is registered under this name.
    UnknownStore(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid store config: {msg}"),
            Self::DuplicateStore(name) => write!(f, "store '{name}' already exists"),
            Self::Destroyed(name) => write!(f, "store '{name}' has been destroyed"),
            Self::Reentrant { store, action } => write!(
                f,
                "reentrant mutation '{action}' on store '{store}' from inside its own pipeline"
            ),
            Self::InvalidTransactionState { expected, actual } => write!(
                f,
                "invalid transaction state: expected {expected}, found {actual}"
            ),
            Self::Persistence { store, source } => {
                write!(f, "failed to persist store '{store}': {source}")
            }
            Self::Plugin(err) => fmt::Display::fmt(err, f),
            Self::Codec { store, message } => {
                write!(f, "state conversion failed for store '{store}': {message}")
            }
            Self::RollbackVetoed { store, plugin } => write!(
                f,
                "rollback of store '{store}' vetoed by plugin '{plugin}'; snapshot not restored"
            ),
            Self::UnknownAction(id) => write!(f, "no recorded action with id {id}"),
            Self::UnknownStore(name) => write!(f, "no store registered as '{name}'"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence { source, .. } => Some(source),
            Self::Plugin(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PluginError> for StoreError {
    fn from(err: PluginError) -> Self {
        Self::Plugin(err)
    }
}

/// Failure of a transaction run by [`Store::transaction`](crate::Store::transaction).
#[derive(Debug)]
pub enum TransactionError<E> {
    /// The body failed; the transaction was rolled back before returning.
    Body(E),
    /// The body succeeded but committing (or a store operation) failed.
    Store(StoreError),
}

impl<E> TransactionError<E> {
    /// The body error, if that is what failed.
    pub fn into_body(self) -> Option<E> {
        match self {
            Self::Body(err) => Some(err),
            Self::Store(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for TransactionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(err) => write!(f, "transaction rolled back: {err}"),
            Self::Store(err) => write!(f, "transaction failed: {err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for TransactionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Body(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl<E> From<StoreError> for TransactionError<E> {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}
