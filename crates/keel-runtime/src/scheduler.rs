#![forbid(unsafe_code)]

//! Update schedulers: debounce, throttle and keyed batching.
//!
//! Schedulers never spawn timers. A host loop calls `poll()` and uses
//! `next_deadline()` to decide when to call it again; tests drive them with a
//! [`ManualClock`](keel_core::ManualClock). Dropping a scheduler discards its
//! pending work.
//!
//! - [`Debouncer`]: merges payloads and applies once the input went quiet for
//!   `delay`.
//! - [`Throttler`]: applies the first payload of a window at once and the
//!   latest one of the rest of the window when it closes.
//! - [`BatchContext`]: queues keyed work while a batch is open; only the last
//!   closure per key runs when the outermost batch ends.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use keel_core::{Clock, SystemClock};
use keel_reactive::BatchScope;
use serde_json::Value;
use web_time::Instant;

/// Shallow JSON merge: keys of `patch` overwrite keys of `base`.
///
/// If either side is not an object, `patch` replaces `base`.
#[must_use]
pub fn merge_json(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            base.extend(patch);
            Value::Object(base)
        }
        (_, patch) => patch,
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

/// Coalesces bursts of payloads into one application after a quiet period.
///
/// ```
/// use std::rc::Rc;
/// use std::time::Duration;
/// use keel_core::ManualClock;
/// use keel_runtime::scheduler::Debouncer;
///
/// let clock = ManualClock::new();
/// let mut sum = Debouncer::new(Duration::from_millis(300), |n: u32| n)
///     .with_clock(Rc::new(clock.clone()))
///     .with_merge(|a, b| a + b);
/// sum.update(1);
/// sum.update(2);
/// assert_eq!(sum.poll(), None);
/// clock.advance(Duration::from_millis(300));
/// assert_eq!(sum.poll(), Some(3));
/// ```
pub struct Debouncer<P, R = ()> {
    delay: Duration,
    clock: Rc<dyn Clock>,
    apply: Box<dyn FnMut(P) -> R>,
    merge: Box<dyn Fn(P, P) -> P>,
    pending: Option<(P, Instant)>,
}

impl<P: 'static, R> Debouncer<P, R> {
    /// Debouncer applying with `apply` after `delay` of silence. Later
    /// payloads replace earlier ones unless [`with_merge`](Self::with_merge)
    /// says otherwise.
    pub fn new(delay: Duration, apply: impl FnMut(P) -> R + 'static) -> Self {
        Self {
            delay,
            clock: Rc::new(SystemClock),
            apply: Box::new(apply),
            merge: Box::new(|_, latest| latest),
            pending: None,
        }
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Combine the pending payload with a new one using `merge(pending, new)`.
    #[must_use]
    pub fn with_merge(mut self, merge: impl Fn(P, P) -> P + 'static) -> Self {
        self.merge = Box::new(merge);
        self
    }

    /// Accumulate `payload` and restart the quiet period.
    pub fn update(&mut self, payload: P) {
        let payload = match self.pending.take() {
            Some((pending, _)) => (self.merge)(pending, payload),
            None => payload,
        };
        self.pending = Some((payload, self.clock.now() + self.delay));
    }

    /// Apply the accumulated payload if the quiet period has elapsed.
    pub fn poll(&mut self) -> Option<R> {
        let due = matches!(&self.pending, Some((_, deadline)) if self.clock.now() >= *deadline);
        if due { self.flush() } else { None }
    }

    /// Apply the accumulated payload now.
    pub fn flush(&mut self) -> Option<R> {
        let (payload, _) = self.pending.take()?;
        Some((self.apply)(payload))
    }

    /// Discard the accumulated payload. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Whether a payload is waiting.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending payload becomes due.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, deadline)| *deadline)
    }
}

impl<P, R> std::fmt::Debug for Debouncer<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Throttler
// ---------------------------------------------------------------------------

/// Applies at most once per window, keeping only the latest trailing payload.
pub struct Throttler<P, R = ()> {
    delay: Duration,
    clock: Rc<dyn Clock>,
    apply: Box<dyn FnMut(P) -> R>,
    window_start: Option<Instant>,
    trailing: Option<P>,
}

impl<P, R> Throttler<P, R> {
    /// Throttler with windows of `delay`.
    pub fn new(delay: Duration, apply: impl FnMut(P) -> R + 'static) -> Self {
        Self {
            delay,
            clock: Rc::new(SystemClock),
            apply: Box::new(apply),
            window_start: None,
            trailing: None,
        }
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn in_window(&self, now: Instant) -> bool {
        self.window_start
            .is_some_and(|start| now < start + self.delay)
    }

    fn apply_now(&mut self, payload: P, now: Instant) -> R {
        self.window_start = Some(now);
        (self.apply)(payload)
    }

    /// Apply `payload` now if no window is open, otherwise keep it as the
    /// trailing payload.
    ///
    /// A trailing payload still owed from a closed window is applied first;
    /// `payload` then becomes the trailing payload of the window that opened.
    ///
    /// Returns the application result when something applied.
    pub fn update(&mut self, payload: P) -> Option<R> {
        let now = self.clock.now();
        if self.in_window(now) {
            self.trailing = Some(payload);
            return None;
        }
        if let Some(owed) = self.trailing.take() {
            let applied = self.apply_now(owed, now);
            self.trailing = Some(payload);
            return Some(applied);
        }
        Some(self.apply_now(payload, now))
    }

    /// Apply the trailing payload once its window has closed.
    pub fn poll(&mut self) -> Option<R> {
        let now = self.clock.now();
        if self.trailing.is_none() || self.in_window(now) {
            return None;
        }
        let payload = self.trailing.take()?;
        Some(self.apply_now(payload, now))
    }

    /// Apply the trailing payload now.
    pub fn flush(&mut self) -> Option<R> {
        let payload = self.trailing.take()?;
        let now = self.clock.now();
        Some(self.apply_now(payload, now))
    }

    /// Discard the trailing payload. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        self.trailing.take().is_some()
    }

    /// Whether a trailing payload is waiting.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.trailing.is_some()
    }

    /// When the trailing payload becomes due.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.trailing.as_ref()?;
        self.window_start.map(|start| start + self.delay)
    }
}

impl<P, R> std::fmt::Debug for Throttler<P, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("delay", &self.delay)
            .field("pending", &self.trailing.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BatchContext
// ---------------------------------------------------------------------------

type Work = Box<dyn FnOnce()>;

#[derive(Default)]
struct BatchState {
    depth: u32,
    queue: Vec<(String, Work)>,
}

/// Explicit batching context. Clones share the same batch.
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use keel_runtime::scheduler::BatchContext;
///
/// let batch = BatchContext::new();
/// let last = Rc::new(Cell::new(0));
/// batch.run(|| {
///     for n in 1..=3 {
///         let last = Rc::clone(&last);
///         batch.schedule("counter::set", move || last.set(n));
///     }
///     assert_eq!(last.get(), 0);
/// });
/// assert_eq!(last.get(), 3);
/// ```
#[derive(Clone, Default)]
pub struct BatchContext {
    state: Rc<RefCell<BatchState>>,
}

impl BatchContext {
    /// Context with no open batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a (possibly nested) batch until the guard drops.
    #[must_use]
    pub fn begin(&self) -> BatchGuard {
        self.state.borrow_mut().depth += 1;
        BatchGuard {
            context: self.clone(),
        }
    }

    /// Run `f` inside a batch.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.begin();
        f()
    }

    /// Whether a batch is open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.borrow().depth > 0
    }

    /// Nesting depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.state.borrow().depth
    }

    /// Number of queued keys.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Queue `work` under `key`, replacing earlier work with the same key.
    /// Runs `work` immediately when no batch is open.
    pub fn schedule(&self, key: impl Into<String>, work: impl FnOnce() + 'static) {
        let work: Work = Box::new(work);
        let immediate = {
            let mut state = self.state.borrow_mut();
            if state.depth == 0 {
                Some(work)
            } else {
                let key = key.into();
                match state.queue.iter_mut().find(|(queued, _)| *queued == key) {
                    Some(slot) => slot.1 = work,
                    None => state.queue.push((key, work)),
                }
                None
            }
        };
        if let Some(work) = immediate {
            work();
        }
    }

    fn end(&self) {
        let drained = {
            let mut state = self.state.borrow_mut();
            state.depth = state.depth.saturating_sub(1);
            if state.depth > 0 {
                return;
            }
            std::mem::take(&mut state.queue)
        };
        if drained.is_empty() {
            return;
        }
        tracing::trace!(keys = drained.len(), "batch flush");
        let _notify_once = BatchScope::new();
        for (_, work) in drained {
            work();
        }
    }
}

impl std::fmt::Debug for BatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("BatchContext")
            .field("depth", &state.depth)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// Closes one level of a [`BatchContext`] on drop.
#[must_use = "the batch ends when the guard is dropped"]
pub struct BatchGuard {
    context: BatchContext,
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.context.end();
    }
}

impl std::fmt::Debug for BatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchGuard")
            .field("depth", &self.context.depth())
            .finish()
    }
}
