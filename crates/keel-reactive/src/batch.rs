#![forbid(unsafe_code)]

//! Deferred notification scopes.
//!
//! While a [`BatchScope`] is alive, sources still update their values
//! immediately but queue their notifications. When the outermost scope is
//! dropped, the queue is flushed in the order sources first changed.
//!
//! The store engine opens a scope around every mutation pipeline run, so
//! subscribers only ever hear about a change after the pipeline has finished
//! (persistence written, history recorded, after-hooks run).
//!
//! # Invariants
//!
//! 1. Nested scopes are supported; only the outermost scope flushes.
//! 2. A keyed notification (one per `Observable`) is queued at most once per
//!    batch; later changes to the same source ride on the queued entry.
//! 3. Unkeyed notifications (stream emissions) are all queued.
//! 4. Notifications queued during the flush itself are run in the same flush.

use std::cell::RefCell;

type Deferred = Box<dyn FnOnce()>;

struct BatchState {
    depth: u32,
    queue: Vec<(Option<usize>, Deferred)>,
}

thread_local! {
    static BATCH: RefCell<BatchState> = const {
        RefCell::new(BatchState {
            depth: 0,
            queue: Vec::new(),
        })
    };
}

/// RAII guard deferring notifications until the outermost scope exits.
///
/// # Example
///
/// ```
/// use keel_reactive::{BatchScope, Observable};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let count = Observable::new(0);
/// let calls = Rc::new(Cell::new(0));
/// let c = Rc::clone(&calls);
/// let _sub = count.subscribe(move |_| c.set(c.get() + 1));
///
/// {
///     let _batch = BatchScope::new();
///     count.set(1);
///     count.set(2);
///     assert_eq!(count.get(), 2);
///     assert_eq!(calls.get(), 0);
/// }
/// assert_eq!(calls.get(), 1);
/// ```
#[must_use = "dropping a BatchScope flushes immediately"]
pub struct BatchScope {
    _private: (),
}

impl BatchScope {
    /// Open a (possibly nested) batch.
    pub fn new() -> Self {
        BATCH.with(|b| b.borrow_mut().depth += 1);
        Self { _private: () }
    }

    /// Whether any batch is open on this thread.
    #[must_use]
    pub fn is_active() -> bool {
        BATCH.with(|b| b.borrow().depth > 0)
    }

    /// Current nesting depth.
    #[must_use]
    pub fn depth() -> u32 {
        BATCH.with(|b| b.borrow().depth)
    }
}

impl Default for BatchScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        let outermost = BATCH.with(|b| {
            let mut state = b.borrow_mut();
            state.depth = state.depth.saturating_sub(1);
            state.depth == 0
        });
        if outermost {
            flush();
        }
    }
}

impl std::fmt::Debug for BatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScope")
            .field("depth", &Self::depth())
            .finish()
    }
}

/// Run `notify` now, or queue it if a batch is open.
///
/// `key` deduplicates queued entries from the same source.
pub(crate) fn defer_or_run(key: Option<usize>, notify: impl FnOnce() + 'static) {
    let notify: Deferred = Box::new(notify);
    let leftover = BATCH.with(|b| {
        let mut state = b.borrow_mut();
        if state.depth == 0 {
            return Some(notify);
        }
        if let Some(k) = key
            && state.queue.iter().any(|(queued, _)| *queued == Some(k))
        {
            return None;
        }
        state.queue.push((key, notify));
        None
    });
    if let Some(run) = leftover {
        run();
    }
}

fn flush() {
    loop {
        let drained: Vec<_> = BATCH.with(|b| std::mem::take(&mut b.borrow_mut().queue));
        if drained.is_empty() {
            break;
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(pending = drained.len(), "batch_flush");
        for (_, notify) in drained {
            notify();
        }
    }
}
