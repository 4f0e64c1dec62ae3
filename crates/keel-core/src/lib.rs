#![forbid(unsafe_code)]

//! Leaf building blocks of the keel state engine.
//!
//! - [`comparator`]: snapshot comparators deciding whether a candidate state
//!   is a change.
//! - [`diff`]: structural diffing of JSON-projected states.
//! - [`persistence`]: namespaced key/value persistence with pluggable codecs
//!   and storage backends.
//! - [`clock`]: monotonic clocks for schedulers and epoch timestamps.

pub mod clock;
pub mod comparator;
pub mod diff;
pub mod persistence;

pub use clock::{Clock, ManualClock, SystemClock, epoch_millis};
pub use comparator::Comparator;
pub use diff::{DiffKind, StateDiff, diff, diff_states};
pub use persistence::{
    FileStorage, FnCodec, JsonCodec, MemoryStorage, PersistenceAdapter, PersistenceError,
    StateCodec, StorageBackend,
};
