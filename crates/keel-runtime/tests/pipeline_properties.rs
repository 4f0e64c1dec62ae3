//! Property tests for the mutation pipeline: dedup, transaction atomicity,
//! undo/redo round trips, redo invalidation and history bounds.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use keel_core::{MemoryStorage, PersistenceError, StorageBackend};
use keel_runtime::{
    History, PersistTo, PluginContext, PluginError, Store, StoreConfig, StoreContext, StoreError,
    StorePlugin, TransactionError, UndoRedoPlugin,
};
use proptest::prelude::*;

/// Backend that counts writes.
#[derive(Default)]
struct CountingBackend {
    inner: MemoryStorage,
    writes: Cell<usize>,
}

impl StorageBackend for CountingBackend {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.writes.set(self.writes.get() + 1);
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        self.inner.keys()
    }
}

/// Plugin that counts hook invocations.
#[derive(Default)]
struct HookCounter {
    before: Cell<usize>,
    after: Cell<usize>,
}

impl StorePlugin<i64> for HookCounter {
    fn on_before_change(
        &self,
        _ctx: &PluginContext<'_, i64>,
    ) -> Result<keel_runtime::Decision, PluginError> {
        self.before.set(self.before.get() + 1);
        Ok(keel_runtime::Decision::Proceed)
    }

    fn on_after_change(&self, _ctx: &PluginContext<'_, i64>) -> Result<(), PluginError> {
        self.after.set(self.after.get() + 1);
        Ok(())
    }
}

fn undoable(max_history: usize) -> (Store<i64>, History<i64>, Rc<UndoRedoPlugin<i64>>) {
    let plugin = Rc::new(UndoRedoPlugin::with_max_history(max_history));
    let store = StoreContext::new()
        .create_store(
            StoreConfig::<i64>::new("numbers").plugin(plugin.clone()),
            || 0,
        )
        .unwrap();
    let history = History::new(&store, Rc::clone(&plugin));
    (store, history, plugin)
}

proptest! {
    #[test]
    fn equal_writes_have_no_side_effects(values in prop::collection::vec(0_i64..4, 1..40)) {
        let backend = Rc::new(CountingBackend::default());
        let hooks = Rc::new(HookCounter::default());
        let ctx = StoreContext::new();
        let store = ctx
            .create_store(
                StoreConfig::<i64>::new("dedup")
                    .persist_to(PersistTo::Custom(backend.clone()))
                    .plugin(hooks.clone())
                    .enable_recording(true),
                || 0,
            )
            .unwrap();

        let mut changes = 0;
        let mut current = 0;
        for value in values {
            let committed = store.set("set", value).unwrap().is_committed();
            prop_assert_eq!(committed, value != current);
            if committed {
                changes += 1;
                current = value;
            }
        }
        prop_assert_eq!(hooks.before.get(), changes);
        prop_assert_eq!(hooks.after.get(), changes);
        prop_assert_eq!(backend.writes.get(), changes);
        // Plus the initial entry.
        prop_assert_eq!(ctx.recorder().entries_for("dedup").len(), changes + 1);
        prop_assert_eq!(store.version(), changes as u64);
    }

    #[test]
    fn failed_transaction_is_atomic(
        start in -100_i64..100,
        deltas in prop::collection::vec(-5_i64..5, 0..20),
    ) {
        let store = Store::new(StoreConfig::new("atomic"), move || start).unwrap();
        let before = store.state();
        let result = store.transaction(|tx| {
            for delta in &deltas {
                tx.update("add", |n| n + delta)?;
            }
            Err::<(), StoreError>(StoreError::InvalidConfig("abort".into()))
        });
        prop_assert!(matches!(result, Err(TransactionError::Body(_))));
        prop_assert_eq!(*store.state(), start);
        // An in-transaction value equal to the snapshot dedups the restore.
        if deltas.iter().sum::<i64>() != 0 {
            prop_assert!(Rc::ptr_eq(&before, &store.state()));
        }
    }

    #[test]
    fn undo_then_redo_round_trips(deltas in prop::collection::vec(1_i64..10, 1..20)) {
        let (store, history, _) = undoable(50);
        let initial = *store.state();
        for delta in &deltas {
            store.update("add", |n| n + delta).unwrap();
        }
        let last = *store.state();

        for _ in &deltas {
            prop_assert!(history.undo().unwrap());
        }
        prop_assert_eq!(*store.state(), initial);
        prop_assert!(!history.undo().unwrap());

        for _ in &deltas {
            prop_assert!(history.redo().unwrap());
        }
        prop_assert_eq!(*store.state(), last);
        prop_assert!(!history.can_redo());
    }

    #[test]
    fn new_action_after_undo_clears_redo(
        deltas in prop::collection::vec(1_i64..10, 1..10),
        undos in 1_usize..10,
        fresh in 1_000_i64..2_000,
    ) {
        let (store, history, _) = undoable(50);
        for delta in &deltas {
            store.update("add", |n| n + delta).unwrap();
        }
        for _ in 0..undos.min(deltas.len()) {
            history.undo().unwrap();
        }
        prop_assert!(history.can_redo());
        store.set("fresh", fresh).unwrap();
        prop_assert!(!history.can_redo());
        prop_assert!(!history.can_redo_observable().get());
    }

    #[test]
    fn past_never_exceeds_max_history(max_history in 1_usize..10, extra in 0_usize..15) {
        let (store, _, plugin) = undoable(max_history);
        for n in 1..=(max_history + extra) {
            store.set("set", n as i64).unwrap();
            prop_assert!(plugin.past_len("numbers") <= max_history);
        }
        prop_assert_eq!(plugin.past_len("numbers"), max_history);
    }
}

#[test]
fn second_undo_waits_for_first_to_apply() {
    let plugin = Rc::new(UndoRedoPlugin::<i64>::new());
    let store = Store::new(
        StoreConfig::<i64>::new("pending").plugin(plugin.clone()),
        || 0,
    )
    .unwrap();
    store.set("one", 1).unwrap();
    store.set("two", 2).unwrap();

    let first = plugin.undo("pending").unwrap();
    assert!(plugin.undo("pending").is_none());
    store
        .mutate(keel_runtime::Update::Restore(first), "@@undo")
        .unwrap();
    assert_eq!(*store.state(), 1);
    assert_eq!(*plugin.undo("pending").unwrap(), 0);
}

#[test]
fn vetoed_undo_keeps_history() {
    struct Frozen(RefCell<bool>);
    impl StorePlugin<i64> for Frozen {
        fn on_before_change(
            &self,
            _ctx: &PluginContext<'_, i64>,
        ) -> Result<keel_runtime::Decision, PluginError> {
            Ok(if *self.0.borrow() {
                keel_runtime::Decision::Veto
            } else {
                keel_runtime::Decision::Proceed
            })
        }
    }

    let frozen = Rc::new(Frozen(RefCell::new(false)));
    let plugin = Rc::new(UndoRedoPlugin::<i64>::new());
    let store = Store::new(
        StoreConfig::<i64>::new("frozen")
            .plugin(frozen.clone())
            .plugin(plugin.clone()),
        || 0,
    )
    .unwrap();
    let history = History::new(&store, plugin.clone());
    store.set("one", 1).unwrap();

    *frozen.0.borrow_mut() = true;
    assert!(!history.undo().unwrap());
    assert_eq!(plugin.past_len("frozen"), 1);

    *frozen.0.borrow_mut() = false;
    assert!(history.undo().unwrap());
    assert_eq!(*store.state(), 0);
}

#[test]
fn vetoed_rollback_is_reported() {
    struct Guard(RefCell<bool>);
    impl StorePlugin<i64> for Guard {
        fn name(&self) -> &str {
            "guard"
        }

        fn on_before_change(
            &self,
            ctx: &PluginContext<'_, i64>,
        ) -> Result<keel_runtime::Decision, PluginError> {
            Ok(if *self.0.borrow() && ctx.action == keel_runtime::ROLLBACK_ACTION {
                keel_runtime::Decision::Veto
            } else {
                keel_runtime::Decision::Proceed
            })
        }
    }

    let guard = Rc::new(Guard(RefCell::new(true)));
    let store = Store::new(StoreConfig::<i64>::new("guarded").plugin(guard.clone()), || 0).unwrap();

    let tx = store.begin_transaction().unwrap();
    tx.set("one", 1).unwrap();
    let err = tx.rollback().unwrap_err();
    assert!(matches!(
        err,
        StoreError::RollbackVetoed { ref store, ref plugin } if store == "guarded" && plugin == "guard"
    ));
    assert_eq!(tx.state(), keel_runtime::TransactionState::RolledBack);
    assert_eq!(*store.state(), 1);

    // The closure form still returns the body error.
    let result = store.transaction(|tx| {
        tx.set("two", 2)?;
        Err::<(), StoreError>(StoreError::InvalidConfig("abort".into()))
    });
    assert!(matches!(result, Err(TransactionError::Body(_))));
    assert_eq!(*store.state(), 2);

    *guard.0.borrow_mut() = false;
    let tx = store.begin_transaction().unwrap();
    tx.set("three", 3).unwrap();
    tx.rollback().unwrap();
    assert_eq!(*store.state(), 2);
}

#[test]
fn failing_rollback_hook_is_reported() {
    struct Broken;
    impl StorePlugin<i64> for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn on_before_change(
            &self,
            ctx: &PluginContext<'_, i64>,
        ) -> Result<keel_runtime::Decision, PluginError> {
            if ctx.action == keel_runtime::ROLLBACK_ACTION {
                return Err(PluginError::new("cannot restore"));
            }
            Ok(keel_runtime::Decision::Proceed)
        }
    }

    let store = Store::new(StoreConfig::<i64>::new("broken").plugin(Rc::new(Broken)), || 0).unwrap();
    let tx = store.begin_transaction().unwrap();
    tx.set("one", 1).unwrap();
    assert!(matches!(
        tx.rollback(),
        Err(StoreError::Plugin(ref err)) if err.plugin == "broken"
    ));
    assert_eq!(tx.state(), keel_runtime::TransactionState::RolledBack);
    assert_eq!(*store.state(), 1);

    // Dropping an active transaction whose rollback fails only logs.
    {
        let tx = store.begin_transaction().unwrap();
        tx.set("two", 2).unwrap();
    }
    assert_eq!(*store.state(), 2);
}
