#![forbid(unsafe_code)]

//! Engine-wide defaults and per-store configuration.
//!
//! [`EngineConfig`] holds the context-wide defaults and can be loaded from
//! TOML or JSON. [`StoreConfig`] is built once per store with a builder; any
//! value it sets wins over the engine default and over the defaults set on
//! the context (`StoreContext::set_default_*`).
//!
//! ```toml
//! namespace = "shop"
//! local_storage_path = "state/local.json"
//! enable_recording = true
//! recording_capacity = 200
//! undo_max_history = 20
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use keel_core::{Comparator, PersistenceError, StateCodec, StorageBackend};
use serde::Deserialize;

use crate::plugin::StorePlugin;

/// Default persistence namespace.
pub const DEFAULT_NAMESPACE: &str = "keel";
/// Default time-travel ring buffer capacity.
pub const DEFAULT_RECORDING_CAPACITY: usize = 100;
/// Default undo history depth.
pub const DEFAULT_UNDO_MAX_HISTORY: usize = 50;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Context-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of every persistence key.
    pub namespace: String,
    /// File backing the `Local` persistence target. In-memory when absent.
    pub local_storage_path: Option<PathBuf>,
    /// Record mutations into the time-travel log unless a store overrides it.
    pub enable_recording: bool,
    /// Time-travel ring buffer capacity. Zero is treated as one.
    pub recording_capacity: usize,
    /// Depth of undo stacks handed out by the context. Zero is treated as
    /// one.
    pub undo_max_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            local_storage_path: None,
            enable_recording: false,
            recording_capacity: DEFAULT_RECORDING_CAPACITY,
            undo_max_history: DEFAULT_UNDO_MAX_HISTORY,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Toml`] on malformed input.
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Toml)
    }

    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Json`] on malformed input.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::Json)
    }

    /// Load a config file, choosing the format by extension
    /// (`.toml` or `.json`).
    ///
    /// # Errors
    ///
    /// I/O failures, parse failures, or an unsupported extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            #[cfg(feature = "toml-config")]
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Failure to load an [`EngineConfig`] or to open what it points at.
#[derive(Debug)]
pub enum ConfigError {
    /// Reading the config file failed.
    Io(io::Error),
    /// The TOML document is malformed.
    #[cfg(feature = "toml-config")]
    Toml(toml::de::Error),
    /// The JSON document is malformed.
    Json(serde_json::Error),
    /// The file extension names no supported format.
    UnsupportedFormat(PathBuf),
    /// The configured storage could not be opened.
    Storage(PersistenceError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            #[cfg(feature = "toml-config")]
            Self::Toml(err) => write!(f, "invalid TOML config: {err}"),
            Self::Json(err) => write!(f, "invalid JSON config: {err}"),
            Self::UnsupportedFormat(path) => {
                write!(f, "unsupported config format: {}", path.display())
            }
            Self::Storage(err) => write!(f, "failed to open storage: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            #[cfg(feature = "toml-config")]
            Self::Toml(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::UnsupportedFormat(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<PersistenceError> for ConfigError {
    fn from(err: PersistenceError) -> Self {
        Self::Storage(err)
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

/// Where a store persists its state.
#[derive(Clone, Default)]
pub enum PersistTo {
    /// Not persisted.
    #[default]
    None,
    /// The context's durable backend.
    Local,
    /// The context's in-memory backend, shared by every store of the context.
    Session,
    /// A caller-supplied backend.
    Custom(Rc<dyn StorageBackend>),
}

impl fmt::Debug for PersistTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::Local => "Local",
            Self::Session => "Session",
            Self::Custom(_) => "Custom(..)",
        })
    }
}

/// Per-store configuration.
///
/// ```
/// use keel_runtime::{PersistTo, StoreConfig};
///
/// let config = StoreConfig::<u32>::new("counter")
///     .persist_to(PersistTo::Session)
///     .enable_recording(true);
/// assert_eq!(config.name(), "counter");
/// ```
pub struct StoreConfig<S> {
    pub(crate) name: String,
    pub(crate) persist_to: Option<PersistTo>,
    pub(crate) comparator: Option<Comparator<S>>,
    pub(crate) plugins: Vec<Rc<dyn StorePlugin<S>>>,
    pub(crate) codec: Option<Rc<dyn StateCodec<S>>>,
    pub(crate) enable_recording: Option<bool>,
}

impl<S> StoreConfig<S> {
    /// Configuration for a store called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persist_to: None,
            comparator: None,
            plugins: Vec::new(),
            codec: None,
            enable_recording: None,
        }
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persist committed states to `target`. Without this the context
    /// default applies, which is [`PersistTo::None`] unless changed.
    #[must_use]
    pub fn persist_to(mut self, target: PersistTo) -> Self {
        self.persist_to = Some(target);
        self
    }

    /// Decide equality of two states with `equals` instead of `PartialEq`.
    #[must_use]
    pub fn comparator(mut self, equals: impl Fn(&S, &S) -> bool + 'static) -> Self {
        self.comparator = Some(Rc::new(equals));
        self
    }

    /// Append a plugin. Runs after global plugins, in registration order.
    #[must_use]
    pub fn plugin(mut self, plugin: Rc<dyn StorePlugin<S>>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Serialize persisted state with `codec` instead of JSON.
    #[must_use]
    pub fn codec(mut self, codec: impl StateCodec<S> + 'static) -> Self {
        self.codec = Some(Rc::new(codec));
        self
    }

    /// Override the engine's recording default.
    #[must_use]
    pub fn enable_recording(mut self, enabled: bool) -> Self {
        self.enable_recording = Some(enabled);
        self
    }
}

impl<S> fmt::Debug for StoreConfig<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .field("persist_to", &self.persist_to)
            .field("custom_comparator", &self.comparator.is_some())
            .field("plugins", &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("custom_codec", &self.codec.is_some())
            .field("enable_recording", &self.enable_recording)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = EngineConfig::from_json_str(r#"{"namespace": "shop"}"#).unwrap();
        assert_eq!(config.namespace, "shop");
        assert_eq!(config.recording_capacity, DEFAULT_RECORDING_CAPACITY);
        assert_eq!(config.undo_max_history, DEFAULT_UNDO_MAX_HISTORY);
        assert!(!config.enable_recording);
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn toml_config_parses() {
        let config = EngineConfig::from_toml_str(
            "namespace = \"shop\"\nenable_recording = true\nlocal_storage_path = \"local.json\"\n",
        )
        .unwrap();
        assert!(config.enable_recording);
        assert_eq!(config.local_storage_path, Some(PathBuf::from("local.json")));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("engine.json");
        std::fs::write(&json, r#"{"undo_max_history": 3}"#).unwrap();
        assert_eq!(EngineConfig::load(&json).unwrap().undo_max_history, 3);

        let yaml = dir.path().join("engine.yaml");
        std::fs::write(&yaml, "namespace: x").unwrap();
        assert!(matches!(
            EngineConfig::load(&yaml),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = EngineConfig::from_json_str("{").unwrap_err();
        assert!(err.to_string().starts_with("invalid JSON config"));
    }

    #[test]
    fn store_config_builder_keeps_settings() {
        let config = StoreConfig::<u32>::new("counter")
            .comparator(|a, b| a / 10 == b / 10)
            .enable_recording(false);
        assert!(config.comparator.is_some());
        assert_eq!(config.enable_recording, Some(false));
        assert!(config.persist_to.is_none());
        let config = config.persist_to(PersistTo::None);
        assert!(matches!(config.persist_to, Some(PersistTo::None)));
    }
}
