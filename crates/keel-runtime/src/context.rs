#![forbid(unsafe_code)]

//! The host context stores are created from.
//!
//! A [`StoreContext`] owns what stores of one application share: the engine
//! defaults, the `Local` and `Session` storage backends, the time-travel
//! recorder, global plugins, per-type store defaults and a teardown
//! registry. It replaces ambient
//! singletons with an explicit value.
//!
//! The registry holds stores weakly. A store dropped by every owner simply
//! disappears from it; [`StoreContext::teardown`] destroys the ones that are
//! still alive, newest first.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use keel_core::{
    Comparator, FileStorage, JsonCodec, MemoryStorage, PersistenceAdapter, StateCodec,
    StorageBackend,
};

use crate::config::{ConfigError, EngineConfig, PersistTo, StoreConfig};
use crate::error::StoreError;
use crate::plugin::{PluginPipeline, StorePlugin};
use crate::store::{RegisteredStore, State, Store, StoreParts};
use crate::time_travel::TimeTravelRecorder;
use crate::undo::UndoRedoPlugin;

struct ContextInner {
    config: EngineConfig,
    local: Rc<dyn StorageBackend>,
    session: Rc<dyn StorageBackend>,
    recorder: TimeTravelRecorder,
    /// `TypeId` of the state type -> `PluginPipeline<S>`.
    global_plugins: RefCell<HashMap<TypeId, Box<dyn Any>>>,
    default_persist_to: RefCell<PersistTo>,
    /// `TypeId` of the state type -> `TypedDefaults<S>`.
    typed_defaults: RefCell<HashMap<TypeId, Box<dyn Any>>>,
    registry: RefCell<Vec<Box<dyn RegisteredStore>>>,
}

/// Comparator and codec used by stores of one state type unless their
/// config names their own.
struct TypedDefaults<S> {
    comparator: Option<Comparator<S>>,
    codec: Option<Rc<dyn StateCodec<S>>>,
}

impl<S> Default for TypedDefaults<S> {
    fn default() -> Self {
        Self {
            comparator: None,
            codec: None,
        }
    }
}

/// Shared configuration and lifecycle owner for a set of stores.
/// Clones share the same context.
#[derive(Clone)]
pub struct StoreContext {
    inner: Rc<ContextInner>,
}

impl Default for StoreContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreContext {
    /// Context with default settings and in-memory backends.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backends(
            EngineConfig::default(),
            Rc::new(MemoryStorage::new()),
            Rc::new(MemoryStorage::new()),
        )
    }

    /// Context for `config`. The `Local` backend is a [`FileStorage`] when
    /// `local_storage_path` is set, in-memory otherwise.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Storage`] if the local storage file cannot be opened.
    pub fn from_config(config: EngineConfig) -> Result<Self, ConfigError> {
        let local: Rc<dyn StorageBackend> = match &config.local_storage_path {
            Some(path) => Rc::new(FileStorage::open(path)?),
            None => Rc::new(MemoryStorage::new()),
        };
        Ok(Self::with_backends(config, local, Rc::new(MemoryStorage::new())))
    }

    /// Context with explicit `Local` and `Session` backends.
    #[must_use]
    pub fn with_backends(
        config: EngineConfig,
        local: Rc<dyn StorageBackend>,
        session: Rc<dyn StorageBackend>,
    ) -> Self {
        let recorder = TimeTravelRecorder::with_capacity(config.recording_capacity);
        Self {
            inner: Rc::new(ContextInner {
                config,
                local,
                session,
                recorder,
                global_plugins: RefCell::new(HashMap::new()),
                default_persist_to: RefCell::new(PersistTo::None),
                typed_defaults: RefCell::new(HashMap::new()),
                registry: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Engine defaults.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Shared time-travel recorder.
    #[must_use]
    pub fn recorder(&self) -> &TimeTravelRecorder {
        &self.inner.recorder
    }

    /// Backend behind [`PersistTo::Local`].
    #[must_use]
    pub fn local_backend(&self) -> &Rc<dyn StorageBackend> {
        &self.inner.local
    }

    /// Backend behind [`PersistTo::Session`].
    #[must_use]
    pub fn session_backend(&self) -> &Rc<dyn StorageBackend> {
        &self.inner.session
    }

    /// Attach `plugin` to every store of state type `S` created afterwards.
    /// Global plugins run before per-store ones.
    pub fn register_global_plugin<S: State>(&self, plugin: Rc<dyn StorePlugin<S>>) {
        let mut map = self.inner.global_plugins.borrow_mut();
        let entry = map
            .entry(TypeId::of::<S>())
            .or_insert_with(|| Box::new(PluginPipeline::<S>::new()));
        if let Some(pipeline) = entry.downcast_mut::<PluginPipeline<S>>() {
            pipeline.register(plugin);
        }
    }

    fn global_plugins<S: State>(&self) -> PluginPipeline<S> {
        self.inner
            .global_plugins
            .borrow()
            .get(&TypeId::of::<S>())
            .and_then(|entry| entry.downcast_ref::<PluginPipeline<S>>())
            .cloned()
            .unwrap_or_default()
    }

    /// Persistence target of stores created afterwards whose config does not
    /// call [`StoreConfig::persist_to`].
    pub fn set_default_persist_to(&self, target: PersistTo) {
        *self.inner.default_persist_to.borrow_mut() = target;
    }

    /// Equality used by stores of state type `S` created afterwards whose
    /// config has no comparator.
    pub fn set_default_comparator<S: State>(&self, equals: impl Fn(&S, &S) -> bool + 'static) {
        self.with_typed_defaults::<S>(|defaults| defaults.comparator = Some(Rc::new(equals)));
    }

    /// Codec used by stores of state type `S` created afterwards whose config
    /// has no codec.
    pub fn set_default_codec<S: State>(&self, codec: impl StateCodec<S> + 'static) {
        self.with_typed_defaults::<S>(|defaults| defaults.codec = Some(Rc::new(codec)));
    }

    fn with_typed_defaults<S: State>(&self, edit: impl FnOnce(&mut TypedDefaults<S>)) {
        let mut map = self.inner.typed_defaults.borrow_mut();
        let entry = map
            .entry(TypeId::of::<S>())
            .or_insert_with(|| Box::new(TypedDefaults::<S>::default()));
        if let Some(defaults) = entry.downcast_mut::<TypedDefaults<S>>() {
            edit(defaults);
        }
    }

    fn typed_defaults<S: State>(&self) -> TypedDefaults<S> {
        self.inner
            .typed_defaults
            .borrow()
            .get(&TypeId::of::<S>())
            .and_then(|entry| entry.downcast_ref::<TypedDefaults<S>>())
            .map(|defaults| TypedDefaults {
                comparator: defaults.comparator.clone(),
                codec: defaults.codec.clone(),
            })
            .unwrap_or_default()
    }

    /// Fresh undo/redo plugin sized by `undo_max_history`.
    #[must_use]
    pub fn undo_plugin<S: State>(&self) -> Rc<UndoRedoPlugin<S>> {
        Rc::new(UndoRedoPlugin::with_max_history(
            self.inner.config.undo_max_history,
        ))
    }

    /// Names of the live stores, oldest first.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.inner
            .registry
            .borrow()
            .iter()
            .filter(|store| store.is_live())
            .filter_map(|store| store.name())
            .collect()
    }

    /// Create a store.
    ///
    /// The first state is the persisted one when readable, otherwise
    /// `initial()`; an unreadable persisted state is logged and ignored.
    ///
    /// Persistence target, comparator and codec left unset in `config` come
    /// from the context defaults.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidConfig`] for an empty name.
    /// - [`StoreError::DuplicateStore`] if a live store has the same name.
    /// - [`StoreError::Plugin`] if an `on_store_init` hook fails; the store
    ///   is destroyed again.
    pub fn create_store<S: State>(
        &self,
        config: StoreConfig<S>,
        initial: impl Fn() -> S + 'static,
    ) -> Result<Store<S>, StoreError> {
        let StoreConfig {
            name,
            persist_to,
            comparator,
            plugins,
            codec,
            enable_recording,
        } = config;
        if name.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "store name must not be empty".to_string(),
            ));
        }
        {
            let mut registry = self.inner.registry.borrow_mut();
            registry.retain(|store| store.is_live());
            if registry.iter().any(|store| store.name().as_deref() == Some(name.as_str())) {
                return Err(StoreError::DuplicateStore(name));
            }
        }

        let persist_to =
            persist_to.unwrap_or_else(|| self.inner.default_persist_to.borrow().clone());
        let backend = match persist_to {
            PersistTo::None => None,
            PersistTo::Local => Some(Rc::clone(&self.inner.local)),
            PersistTo::Session => Some(Rc::clone(&self.inner.session)),
            PersistTo::Custom(backend) => Some(backend),
        };
        let mut pipeline = self.global_plugins::<S>();
        pipeline.extend(plugins);
        let defaults = self.typed_defaults::<S>();

        let store = Store::assemble(StoreParts {
            persistence: backend
                .map(|backend| PersistenceAdapter::new(self.inner.config.namespace.clone(), backend)),
            comparator: comparator
                .or(defaults.comparator)
                .unwrap_or_else(keel_core::comparator::structural),
            plugins: pipeline,
            codec: codec.or(defaults.codec).unwrap_or_else(|| Rc::new(JsonCodec)),
            recorder: self.inner.recorder.clone(),
            recording: enable_recording.unwrap_or(self.inner.config.enable_recording),
            initial: Box::new(initial),
            name,
        });

        self.inner
            .recorder
            .register_target(store.name(), store.jump_target());
        if let Err(err) = store.plugin_pipeline().init(store.name(), &store.state()) {
            if let Err(teardown) = store.destroy() {
                tracing::warn!(store = %store.name(), error = %teardown, "destroy after failed init");
            }
            return Err(err.into());
        }
        self.inner
            .registry
            .borrow_mut()
            .push(Box::new(store.downgrade()));
        tracing::debug!(store = %store.name(), plugins = ?store.plugin_names(), "store created");
        Ok(store)
    }

    /// Destroy every live store created from this context, newest first.
    ///
    /// Returns the number of stores destroyed. Hook failures are logged.
    pub fn teardown(&self) -> usize {
        let registered = std::mem::take(&mut *self.inner.registry.borrow_mut());
        let mut destroyed = 0;
        for store in registered.iter().rev() {
            if !store.is_live() {
                continue;
            }
            destroyed += 1;
            if let Err(err) = store.destroy() {
                tracing::warn!(error = %err, "store teardown failed");
            }
        }
        tracing::debug!(destroyed, "context torn down");
        destroyed
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("config", &self.inner.config)
            .field("stores", &self.store_names())
            .field("recorder", &self.inner.recorder)
            .finish()
    }
}
