#![forbid(unsafe_code)]

//! Plugin hooks around every store mutation.
//!
//! A [`StorePlugin`] can observe store creation and teardown, veto a change
//! before it commits, and observe it after it commits. The
//! [`PluginPipeline`] runs plugins in registration order.
//!
//! # Invariants
//!
//! 1. A plugin instance registered several times (globally and per store)
//!    runs once; identity is the `Rc` allocation.
//! 2. Before-hooks short-circuit: the first veto or error skips the rest.
//! 3. After-hooks run only for committed changes, and all of them run even if
//!    one fails; the first failure is reported.
//! 4. Hooks run synchronously and must not mutate the store they are
//!    attached to. The store rejects such calls with
//!    [`StoreError::Reentrant`](crate::StoreError::Reentrant).

use std::rc::Rc;

use serde::Serialize;

use crate::error::{Hook, PluginError};

/// Everything a hook knows about one mutation attempt.
///
/// Built fresh for every attempt and never persisted.
#[derive(Debug)]
pub struct PluginContext<'a, S> {
    /// Store being mutated.
    pub store_name: &'a str,
    /// Action label supplied by the caller.
    pub action: &'a str,
    /// Committed state before the mutation.
    pub prev_state: &'a Rc<S>,
    /// Candidate (before-hooks) or committed (after-hooks) state.
    pub next_state: &'a Rc<S>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Verdict of a before-change hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// Let the mutation continue.
    #[default]
    Proceed,
    /// Drop the mutation; the store reports `NoChange`.
    Veto,
}

/// Lifecycle hooks around a store of state `S`.
///
/// Every hook defaults to a no-op, so a plugin implements only what it needs.
///
/// ```
/// use keel_runtime::plugin::{Decision, PluginContext, StorePlugin};
/// use keel_runtime::PluginError;
///
/// struct ReadOnlyCheckout;
///
/// impl<S> StorePlugin<S> for ReadOnlyCheckout {
///     fn name(&self) -> &str {
///         "read-only-checkout"
///     }
///
///     fn on_before_change(&self, ctx: &PluginContext<'_, S>) -> Result<Decision, PluginError> {
///         Ok(if ctx.action == "setPaymentMethod" {
///             Decision::Veto
///         } else {
///             Decision::Proceed
///         })
///     }
/// }
/// ```
pub trait StorePlugin<S> {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once per store, after its first state is resolved.
    fn on_store_init(&self, _store_name: &str, _initial: &Rc<S>) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called before a candidate state commits. Returning
    /// [`Decision::Veto`] or an error aborts the mutation.
    fn on_before_change(&self, _ctx: &PluginContext<'_, S>) -> Result<Decision, PluginError> {
        Ok(Decision::Proceed)
    }

    /// Called after a change committed, was persisted and recorded.
    fn on_after_change(&self, _ctx: &PluginContext<'_, S>) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once when the store is destroyed. Release per-store resources.
    fn on_store_destroy(&self, _store_name: &str) -> Result<(), PluginError> {
        Ok(())
    }
}

fn same_plugin<S>(a: &Rc<dyn StorePlugin<S>>, b: &Rc<dyn StorePlugin<S>>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Ordered, identity-deduplicated plugin list.
pub struct PluginPipeline<S> {
    plugins: Vec<Rc<dyn StorePlugin<S>>>,
}

impl<S> Clone for PluginPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            plugins: self.plugins.clone(),
        }
    }
}

impl<S> Default for PluginPipeline<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> PluginPipeline<S> {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Append `plugin` unless the same instance is already registered.
    ///
    /// Returns whether it was added.
    pub fn register(&mut self, plugin: Rc<dyn StorePlugin<S>>) -> bool {
        if self.plugins.iter().any(|p| same_plugin(p, &plugin)) {
            return false;
        }
        self.plugins.push(plugin);
        true
    }

    /// Register several plugins in order.
    pub fn extend(&mut self, plugins: impl IntoIterator<Item = Rc<dyn StorePlugin<S>>>) {
        for plugin in plugins {
            self.register(plugin);
        }
    }

    /// Number of distinct plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugin is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugin names in invocation order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Run `on_store_init` on every plugin; stops at the first failure.
    pub fn init(&self, store_name: &str, initial: &Rc<S>) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin
                .on_store_init(store_name, initial)
                .map_err(|e| e.located(plugin.name(), Hook::Init))?;
        }
        Ok(())
    }

    /// Run before-hooks in order.
    ///
    /// Returns the name of the vetoing plugin, if any.
    pub fn before(&self, ctx: &PluginContext<'_, S>) -> Result<Option<String>, PluginError> {
        for plugin in &self.plugins {
            let decision = plugin
                .on_before_change(ctx)
                .map_err(|e| e.located(plugin.name(), Hook::BeforeChange))?;
            if decision == Decision::Veto {
                return Ok(Some(plugin.name().to_string()));
            }
        }
        Ok(None)
    }

    /// Run every after-hook; report the first failure.
    pub fn after(&self, ctx: &PluginContext<'_, S>) -> Result<(), PluginError> {
        let mut first = None;
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_after_change(ctx) {
                first.get_or_insert(err.located(plugin.name(), Hook::AfterChange));
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Run every destroy hook; report the first failure.
    pub fn destroy(&self, store_name: &str) -> Result<(), PluginError> {
        let mut first = None;
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_store_destroy(store_name) {
                first.get_or_insert(err.located(plugin.name(), Hook::Destroy));
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl<S> std::fmt::Debug for PluginPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("plugins", &self.names())
            .finish()
    }
}

/// Logs every committed change and its structural diff through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPlugin;

impl<S: Serialize> StorePlugin<S> for TracingPlugin {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_store_init(&self, store_name: &str, _initial: &Rc<S>) -> Result<(), PluginError> {
        tracing::debug!(store = store_name, "store_init");
        Ok(())
    }

    fn on_after_change(&self, ctx: &PluginContext<'_, S>) -> Result<(), PluginError> {
        match keel_core::diff_states(&**ctx.prev_state, &**ctx.next_state) {
            Ok(changes) => {
                for change in &changes {
                    tracing::debug!(store = ctx.store_name, action = ctx.action, %change, "state_change");
                }
            }
            Err(err) => {
                tracing::warn!(store = ctx.store_name, action = ctx.action, error = %err, "state_change_undiffable");
            }
        }
        Ok(())
    }

    fn on_store_destroy(&self, store_name: &str) -> Result<(), PluginError> {
        tracing::debug!(store = store_name, "store_destroy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recorder {
        label: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        veto: bool,
        fail_after: bool,
    }

    impl Recorder {
        fn new(label: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                label,
                log: Rc::clone(log),
                veto: false,
                fail_after: false,
            }
        }
    }

    impl StorePlugin<u32> for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn on_before_change(&self, _ctx: &PluginContext<'_, u32>) -> Result<Decision, PluginError> {
            self.log.borrow_mut().push(format!("{}:before", self.label));
            Ok(if self.veto {
                Decision::Veto
            } else {
                Decision::Proceed
            })
        }

        fn on_after_change(&self, _ctx: &PluginContext<'_, u32>) -> Result<(), PluginError> {
            self.log.borrow_mut().push(format!("{}:after", self.label));
            if self.fail_after {
                return Err(PluginError::new("after failed"));
            }
            Ok(())
        }
    }

    fn ctx<'a>(prev: &'a Rc<u32>, next: &'a Rc<u32>) -> PluginContext<'a, u32> {
        PluginContext {
            store_name: "counter",
            action: "inc",
            prev_state: prev,
            next_state: next,
            timestamp: 0,
        }
    }

    #[test]
    fn same_instance_registers_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let shared: Rc<dyn StorePlugin<u32>> = Rc::new(Recorder::new("a", &log));
        let mut pipeline = PluginPipeline::new();
        assert!(pipeline.register(Rc::clone(&shared)));
        assert!(!pipeline.register(Rc::clone(&shared)));
        assert!(pipeline.register(Rc::new(Recorder::new("a", &log))));
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn veto_short_circuits_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut vetoing = Recorder::new("guard", &log);
        vetoing.veto = true;
        let mut pipeline: PluginPipeline<u32> = PluginPipeline::new();
        pipeline.register(Rc::new(Recorder::new("first", &log)));
        pipeline.register(Rc::new(vetoing));
        pipeline.register(Rc::new(Recorder::new("last", &log)));

        let (prev, next) = (Rc::new(0), Rc::new(1));
        let veto = pipeline.before(&ctx(&prev, &next)).unwrap();
        assert_eq!(veto.as_deref(), Some("guard"));
        assert_eq!(*log.borrow(), vec!["first:before", "guard:before"]);
    }

    #[test]
    fn after_hooks_all_run_and_first_error_wins() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut failing = Recorder::new("broken", &log);
        failing.fail_after = true;
        let mut pipeline: PluginPipeline<u32> = PluginPipeline::new();
        pipeline.register(Rc::new(failing));
        pipeline.register(Rc::new(Recorder::new("tail", &log)));

        let (prev, next) = (Rc::new(0), Rc::new(1));
        let err = pipeline.after(&ctx(&prev, &next)).unwrap_err();
        assert_eq!(err.plugin, "broken");
        assert_eq!(err.hook, Some(Hook::AfterChange));
        assert_eq!(*log.borrow(), vec!["broken:after", "tail:after"]);
    }

    #[test]
    fn default_name_is_type_name() {
        struct Quiet;
        impl StorePlugin<u32> for Quiet {}
        let plugin: Rc<dyn StorePlugin<u32>> = Rc::new(Quiet);
        assert!(plugin.name().ends_with("Quiet"));
    }

    #[test]
    fn tracing_plugin_never_vetoes() {
        let (prev, next) = (Rc::new(1_u32), Rc::new(2_u32));
        let plugin = TracingPlugin;
        let context = ctx(&prev, &next);
        assert_eq!(
            StorePlugin::<u32>::on_before_change(&plugin, &context).unwrap(),
            Decision::Proceed
        );
        assert!(StorePlugin::<u32>::on_after_change(&plugin, &context).is_ok());
    }
}
