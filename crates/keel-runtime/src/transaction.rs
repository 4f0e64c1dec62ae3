#![forbid(unsafe_code)]

//! Snapshot-based transactions.
//!
//! A [`Transaction`] captures the store's current `Rc` when it begins.
//! Committed states are immutable, so holding that pointer is a full
//! snapshot. Rolling back restores it with one [`Update::Restore`] through
//! the normal pipeline, so plugins, persistence and the time-travel log see
//! the rollback like any other change.
//!
//! # State machine
//!
//! ```text
//! Active ──commit()──▶ Committed
//!    │
//!    └──rollback() / drop──▶ RolledBack
//! ```
//!
//! Every transaction reaches exactly one terminal state. A transaction whose
//! last handle is dropped while still active (including while unwinding from
//! a panic in its body) rolls back.
//!
//! Transactions do not isolate: a rollback restores the snapshot even if
//! unrelated writes reached the store in the meantime.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use serde_json::Value;

use crate::error::{StoreError, TransactionError};
use crate::store::{Outcome, Reason, State, Store, Update};

/// Action label of the restore performed by a rollback.
pub const ROLLBACK_ACTION: &str = "@@rollback";

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Mutations are accepted.
    Active,
    /// Finished successfully; the snapshot was discarded.
    Committed,
    /// The snapshot was restored.
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

struct TxInner<S: State> {
    store: Store<S>,
    snapshot: Rc<S>,
    state: Cell<TransactionState>,
}

impl<S: State> TxInner<S> {
    fn expect_active(&self) -> Result<(), StoreError> {
        match self.state.get() {
            TransactionState::Active => Ok(()),
            actual => Err(StoreError::InvalidTransactionState {
                expected: TransactionState::Active,
                actual,
            }),
        }
    }

    fn rollback(&self) -> Result<(), StoreError> {
        self.expect_active()?;
        self.state.set(TransactionState::RolledBack);
        tracing::debug!(store = %self.store.name(), "transaction rolled back");
        let outcome =
            self.store.mutate(Update::Restore(Rc::clone(&self.snapshot)), ROLLBACK_ACTION)?;
        match outcome {
            Outcome::NoChange(Reason::Vetoed { plugin }) => Err(StoreError::RollbackVetoed {
                store: self.store.name().to_string(),
                plugin,
            }),
            Outcome::NoChange(Reason::Equal) | Outcome::Committed(_) => Ok(()),
        }
    }
}

impl<S: State> Drop for TxInner<S> {
    fn drop(&mut self) {
        if self.state.get() != TransactionState::Active {
            return;
        }
        tracing::warn!(store = %self.store.name(), "active transaction dropped, rolling back");
        if let Err(err) = self.rollback() {
            tracing::error!(store = %self.store.name(), error = %err, "rollback on drop failed");
        }
    }
}

/// A unit of work on one store. Clones share the same transaction.
pub struct Transaction<S: State> {
    inner: Rc<TxInner<S>>,
}

impl<S: State> Clone for Transaction<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<S: State> Transaction<S> {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.state.get()
    }

    /// State captured when the transaction began.
    #[must_use]
    pub fn snapshot(&self) -> &Rc<S> {
        &self.inner.snapshot
    }

    /// Store the transaction works on.
    #[must_use]
    pub fn store(&self) -> &Store<S> {
        &self.inner.store
    }

    /// Mutate the store as part of this transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransactionState`] once the transaction has
    /// finished, otherwise whatever [`Store::mutate`] reports.
    pub fn mutate(&self, update: Update<'_, S>, action: &str) -> Result<Outcome<S>, StoreError> {
        self.inner.expect_active()?;
        self.inner.store.mutate(update, action)
    }

    /// [`Store::set`] within the transaction.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn set(&self, action: &str, next: S) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::Replace(next), action)
    }

    /// [`Store::update`] within the transaction.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn update(&self, action: &str, f: impl FnOnce(&S) -> S) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::compute(f), action)
    }

    /// [`Store::patch`] within the transaction.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn patch(&self, action: &str, f: impl FnOnce(&mut S)) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::draft(f), action)
    }

    /// [`Store::merge`] within the transaction.
    ///
    /// # Errors
    ///
    /// See [`mutate`](Self::mutate).
    pub fn merge(&self, action: &str, partial: Value) -> Result<Outcome<S>, StoreError> {
        self.mutate(Update::Merge(partial), action)
    }

    /// Finish successfully.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransactionState`] unless active.
    pub fn commit(&self) -> Result<(), StoreError> {
        self.inner.expect_active()?;
        self.inner.state.set(TransactionState::Committed);
        tracing::debug!(store = %self.inner.store.name(), "transaction committed");
        Ok(())
    }

    /// Restore the snapshot.
    ///
    /// The transaction is `RolledBack` even if the restoring mutation fails.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidTransactionState`] unless active,
    /// [`StoreError::RollbackVetoed`] if a plugin vetoed the restore, or the
    /// error of the restoring mutation.
    pub fn rollback(&self) -> Result<(), StoreError> {
        self.inner.rollback()
    }
}

impl<S: State> fmt::Debug for Transaction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("store", &self.inner.store.name())
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl<S: State> Store<S> {
    /// Start a transaction capturing the current state.
    ///
    /// # Errors
    ///
    /// [`StoreError::Destroyed`] if the store has been destroyed.
    pub fn begin_transaction(&self) -> Result<Transaction<S>, StoreError> {
        if self.is_destroyed() {
            return Err(StoreError::Destroyed(self.name().to_string()));
        }
        tracing::debug!(store = %self.name(), version = self.version(), "transaction begun");
        Ok(Transaction {
            inner: Rc::new(TxInner {
                store: self.clone(),
                snapshot: self.state(),
                state: Cell::new(TransactionState::Active),
            }),
        })
    }

    /// Run `body` in a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// A body that already committed or rolled back is left alone.
    ///
    /// ```
    /// use keel_runtime::{Store, StoreConfig, TransactionError};
    ///
    /// let stock = Store::new(StoreConfig::new("stock"), || 10_i32).unwrap();
    /// let result = stock.transaction(|tx| {
    ///     tx.update("reserve", |n| n - 4).map_err(|e| e.to_string())?;
    ///     if *tx.store().state() < 8 {
    ///         return Err("would drop below 8".to_string());
    ///     }
    ///     Ok(())
    /// });
    /// assert!(matches!(result, Err(TransactionError::Body(_))));
    /// assert_eq!(*stock.state(), 10);
    /// ```
    ///
    /// # Errors
    ///
    /// [`TransactionError::Body`] after rolling back, or
    /// [`TransactionError::Store`] if the transaction could not start or commit.
    pub fn transaction<T, E>(
        &self,
        body: impl FnOnce(&Transaction<S>) -> Result<T, E>,
    ) -> Result<T, TransactionError<E>> {
        let tx = self.begin_transaction()?;
        let result = body(&tx);
        finish(&tx, result)
    }

    /// Async form of [`transaction`](Self::transaction). The body receives
    /// an owned handle it can hold across `.await` points.
    ///
    /// # Errors
    ///
    /// See [`transaction`](Self::transaction).
    pub async fn transaction_async<T, E, F, Fut>(&self, body: F) -> Result<T, TransactionError<E>>
    where
        F: FnOnce(Transaction<S>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let tx = self.begin_transaction()?;
        let result = body(tx.clone()).await;
        finish(&tx, result)
    }
}

fn finish<S: State, T, E>(
    tx: &Transaction<S>,
    result: Result<T, E>,
) -> Result<T, TransactionError<E>> {
    let active = tx.state() == TransactionState::Active;
    match result {
        Ok(value) => {
            if active {
                tx.commit()?;
            }
            Ok(value)
        }
        Err(err) => {
            if active && let Err(rollback) = tx.rollback() {
                tracing::error!(store = %tx.store().name(), error = %rollback, "rollback failed");
            }
            Err(TransactionError::Body(err))
        }
    }
}
