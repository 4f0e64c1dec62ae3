#![forbid(unsafe_code)]

//! Namespaced state persistence.
//!
//! Persistence is split in three layers:
//!
//! - [`StorageBackend`]: a raw string key/value store (in-memory, JSON file,
//!   or anything the host provides).
//! - [`StateCodec`]: turns a state into the stored string and back
//!   ([`JsonCodec`] by default, [`FnCodec`] for custom closures).
//! - [`PersistenceAdapter`]: binds a backend to a namespace. Store `name` is
//!   stored under `"<namespace>::<name>"`.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Surfaced as |
//! |---------|-------|-------------|
//! | Backend I/O error | Disk full, permissions | [`PersistenceError::Io`] |
//! | Quota exceeded | Backend size limit | [`PersistenceError::QuotaExceeded`] |
//! | Encode error | State not serializable | [`PersistenceError::Encode`] |
//! | Decode error | Schema drift, corrupt data | [`PersistenceError::Decode`] |

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Separator between namespace and store name in persistence keys.
pub const KEY_SEPARATOR: &str = "::";

/// Errors from persistence operations.
#[derive(Debug)]
pub enum PersistenceError {
    /// The backend failed at the I/O level.
    Io(io::Error),
    /// Writing `key` would exceed the backend's size limit.
    QuotaExceeded {
        /// Key being written.
        key: String,
        /// Configured limit in bytes.
        limit: usize,
    },
    /// The state could not be serialized.
    Encode(String),
    /// The stored string could not be turned back into a state.
    Decode(String),
    /// Any other backend-specific failure.
    Backend(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "storage i/o error: {err}"),
            Self::QuotaExceeded { key, limit } => {
                write!(f, "storage quota of {limit} bytes exceeded writing '{key}'")
            }
            Self::Encode(msg) => write!(f, "failed to encode state: {msg}"),
            Self::Decode(msg) => write!(f, "failed to decode state: {msg}"),
            Self::Backend(msg) => write!(f, "storage backend error: {msg}"),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PersistenceError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Raw string key/value storage.
///
/// Methods take `&self`; backends are shared handles with interior
/// mutability, like the host storage objects they stand in for.
pub trait StorageBackend {
    /// Read `key`.
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    /// Write `key`.
    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
    /// Delete `key`. Deleting a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
    /// Every stored key.
    fn keys(&self) -> Result<Vec<String>, PersistenceError>;
}

/// In-memory backend, the stand-in for session storage.
///
/// Clones share the same map. An optional quota (total bytes of keys and
/// values) makes writes fail the way a full browser store does.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    map: Rc<RefCell<BTreeMap<String, String>>>,
    quota: Option<usize>,
}

impl MemoryStorage {
    /// Unlimited in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory storage that rejects writes beyond `bytes`.
    #[must_use]
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            map: Rc::default(),
            quota: Some(bytes),
        }
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    fn used_bytes_without(&self, key: &str) -> usize {
        self.map
            .borrow()
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        if let Some(limit) = self.quota
            && self.used_bytes_without(key) + key.len() + value.len() > limit
        {
            return Err(PersistenceError::QuotaExceeded {
                key: key.to_string(),
                limit,
            });
        }
        self.map
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.map.borrow_mut().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.map.borrow().keys().cloned().collect())
    }
}

/// Durable backend storing every key in one JSON object file.
///
/// The file is read once on open and rewritten on every change through a
/// sibling temp file and a rename, so a crash never leaves a torn file.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    cache: Rc<RefCell<BTreeMap<String, String>>>,
}

impl FileStorage {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or is not a JSON object of
    /// strings.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let cache = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| PersistenceError::Decode(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(path = %path.display(), keys = cache.len(), "file_storage_open");
        Ok(Self {
            path,
            cache: Rc::new(RefCell::new(cache)),
        })
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_string_pretty(&*self.cache.borrow())
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.cache.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let previous = self
            .cache
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        if let Err(err) = self.save() {
            // Keep the cache in step with what is on disk.
            let mut cache = self.cache.borrow_mut();
            match previous {
                Some(prev) => cache.insert(key.to_string(), prev),
                None => cache.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        let Some(previous) = self.cache.borrow_mut().remove(key) else {
            return Ok(());
        };
        if let Err(err) = self.save() {
            self.cache.borrow_mut().insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.cache.borrow().keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

/// Converts a state to its stored string form and back.
pub trait StateCodec<S> {
    /// Serialize `state`.
    fn encode(&self, state: &S) -> Result<String, PersistenceError>;
    /// Deserialize `raw`.
    fn decode(&self, raw: &str) -> Result<S, PersistenceError>;
}

/// `serde_json` codec. The default for every store.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<S: Serialize + DeserializeOwned> StateCodec<S> for JsonCodec {
    fn encode(&self, state: &S) -> Result<String, PersistenceError> {
        serde_json::to_string(state).map_err(|e| PersistenceError::Encode(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<S, PersistenceError> {
        serde_json::from_str(raw).map_err(|e| PersistenceError::Decode(e.to_string()))
    }
}

type EncodeFn<S> = Rc<dyn Fn(&S) -> Result<String, String>>;
type DecodeFn<S> = Rc<dyn Fn(&str) -> Result<S, String>>;

/// Codec built from a pair of closures.
///
/// ```
/// use keel_core::persistence::{FnCodec, StateCodec};
///
/// let codec = FnCodec::new(
///     |n: &u32| Ok(format!("n={n}")),
///     |raw: &str| raw.strip_prefix("n=").and_then(|v| v.parse().ok()).ok_or_else(|| raw.to_string()),
/// );
/// assert_eq!(codec.encode(&7).unwrap(), "n=7");
/// assert_eq!(codec.decode("n=7").unwrap(), 7);
/// ```
pub struct FnCodec<S> {
    encode: EncodeFn<S>,
    decode: DecodeFn<S>,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for FnCodec<S> {
    fn clone(&self) -> Self {
        Self {
            encode: Rc::clone(&self.encode),
            decode: Rc::clone(&self.decode),
            _state: PhantomData,
        }
    }
}

impl<S> FnCodec<S> {
    /// Build a codec from `encode` and `decode` closures.
    pub fn new(
        encode: impl Fn(&S) -> Result<String, String> + 'static,
        decode: impl Fn(&str) -> Result<S, String> + 'static,
    ) -> Self {
        Self {
            encode: Rc::new(encode),
            decode: Rc::new(decode),
            _state: PhantomData,
        }
    }
}

impl<S> StateCodec<S> for FnCodec<S> {
    fn encode(&self, state: &S) -> Result<String, PersistenceError> {
        (self.encode)(state).map_err(PersistenceError::Encode)
    }

    fn decode(&self, raw: &str) -> Result<S, PersistenceError> {
        (self.decode)(raw).map_err(PersistenceError::Decode)
    }
}

impl<S> std::fmt::Debug for FnCodec<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCodec").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// A storage backend bound to a key namespace.
#[derive(Clone)]
pub struct PersistenceAdapter {
    namespace: String,
    backend: Rc<dyn StorageBackend>,
}

impl PersistenceAdapter {
    /// Bind `backend` to `namespace`.
    pub fn new(namespace: impl Into<String>, backend: Rc<dyn StorageBackend>) -> Self {
        Self {
            namespace: namespace.into(),
            backend,
        }
    }

    /// Namespace prefix.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Rc<dyn StorageBackend> {
        &self.backend
    }

    /// Persistence key for `store`: `"<namespace>::<store>"`.
    #[must_use]
    pub fn key_for(&self, store: &str) -> String {
        format!("{}{KEY_SEPARATOR}{store}", self.namespace)
    }

    /// Load and decode the state persisted for `store`.
    ///
    /// # Errors
    ///
    /// Backend or decode failures.
    pub fn read<S>(
        &self,
        store: &str,
        codec: &dyn StateCodec<S>,
    ) -> Result<Option<S>, PersistenceError> {
        match self.backend.get(&self.key_for(store))? {
            Some(raw) => codec.decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Encode and persist `state` for `store`.
    ///
    /// # Errors
    ///
    /// Encode or backend failures (including quota).
    pub fn write<S>(
        &self,
        store: &str,
        state: &S,
        codec: &dyn StateCodec<S>,
    ) -> Result<(), PersistenceError> {
        let raw = codec.encode(state)?;
        self.backend.set(&self.key_for(store), &raw)
    }

    /// Delete the persisted state of `store`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub fn remove(&self, store: &str) -> Result<(), PersistenceError> {
        self.backend.remove(&self.key_for(store))
    }

    /// Delete every key under this namespace, leaving other keys untouched.
    ///
    /// Returns the number of keys removed.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub fn clear(&self) -> Result<usize, PersistenceError> {
        let prefix = format!("{}{KEY_SEPARATOR}", self.namespace);
        let owned: Vec<String> = self
            .backend
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        for key in &owned {
            self.backend.remove(key)?;
        }
        Ok(owned.len())
    }
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
