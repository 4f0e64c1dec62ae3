//! End-to-end scenarios: undo/redo, transactional rollback, debounced
//! updates, plugin vetoes and structural diffs.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use keel_core::{DiffKind, ManualClock, StateDiff};
use keel_runtime::{
    Decision, History, Outcome, PluginContext, PluginError, Reason, StoreConfig, StoreContext,
    StoreError, StorePlugin, TimeTravelRecorder, TransactionError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cart {
    items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Checkout {
    payment_method: Option<String>,
    step: u8,
}

#[derive(Debug)]
enum CheckoutError {
    Store(StoreError),
    Declined,
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

#[test]
fn counter_undo_and_redo() {
    let ctx = StoreContext::new();
    let undo = ctx.undo_plugin::<Counter>();
    let store = ctx
        .create_store(
            StoreConfig::<Counter>::new("counter").plugin(undo.clone()),
            || Counter { count: 0 },
        )
        .unwrap();
    let history = History::new(&store, undo);

    for _ in 0..3 {
        store
            .update("increment", |s| Counter { count: s.count + 1 })
            .unwrap();
    }
    assert_eq!(store.state().count, 3);

    assert!(history.undo().unwrap());
    assert_eq!(store.state().count, 2);
    assert!(history.can_redo());

    assert!(history.redo().unwrap());
    assert_eq!(store.state().count, 3);
    assert!(!history.can_redo());
}

#[test]
fn failed_transaction_restores_empty_cart() {
    let store = StoreContext::new()
        .create_store(StoreConfig::new("cart"), || Cart { items: vec![] })
        .unwrap();
    let before = store.state();
    let seen = Rc::new(Cell::new(0));
    let counter = Rc::clone(&seen);
    let _sub = store.subscribe(move |_| counter.set(counter.get() + 1));

    let result = store.transaction(|tx| {
        tx.patch("addItem", |c| c.items.push("apple".into()))?;
        tx.patch("addItem", |c| c.items.push("pear".into()))?;
        assert_eq!(tx.store().state().items.len(), 2);
        Err::<(), _>(CheckoutError::Declined)
    });

    assert!(matches!(
        result,
        Err(TransactionError::Body(CheckoutError::Declined))
    ));
    assert_eq!(*store.state(), Cart { items: vec![] });
    assert!(Rc::ptr_eq(&before, &store.state()));
    // Two adds and the rollback.
    assert_eq!(seen.get(), 3);
}

#[test]
fn debounced_updates_apply_once_with_last_value() {
    let store = StoreContext::new()
        .create_store(StoreConfig::new("counter"), || Counter { count: 0 })
        .unwrap();
    let commits = Rc::new(Cell::new(0));
    let counter = Rc::clone(&commits);
    let _sub = store.subscribe(move |_| counter.set(counter.get() + 1));

    let clock = ManualClock::new();
    let mut debounced = store
        .debounced("setCount", Duration::from_millis(100))
        .with_clock(Rc::new(clock.clone()));

    debounced.update(json!({"count": 1}));
    clock.advance(Duration::from_millis(40));
    debounced.update(json!({"count": 2}));
    clock.advance(Duration::from_millis(40));
    debounced.update(json!({"count": 3}));

    clock.advance(Duration::from_millis(60));
    assert!(debounced.poll().is_none(), "timer restarted by last call");
    assert_eq!(store.state().count, 0);

    clock.advance(Duration::from_millis(40));
    let outcome = debounced.poll().unwrap().unwrap();
    assert!(outcome.is_committed());
    assert_eq!(store.state().count, 3);
    assert_eq!(commits.get(), 1);
    assert!(debounced.poll().is_none());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    age: u32,
    tags: Vec<String>,
}

#[test]
fn throttled_store_applies_trailing_update_owed_across_missed_poll() {
    let store = StoreContext::new()
        .create_store(StoreConfig::new("profile"), || Profile {
            name: "a".into(),
            age: 0,
            tags: vec![],
        })
        .unwrap();
    let clock = ManualClock::new();
    let mut throttled = store
        .throttled("edit", Duration::from_millis(100))
        .with_clock(Rc::new(clock.clone()));

    let leading = throttled.update(json!({"name": "b"})).unwrap().unwrap();
    assert!(leading.is_committed());
    assert!(throttled.update(json!({"age": 5})).is_none());
    assert_eq!(store.state().age, 0);

    // The window closes without a poll; the next update settles the debt.
    clock.advance(Duration::from_millis(150));
    let owed = throttled.update(json!({"tags": ["x"]})).unwrap().unwrap();
    assert!(owed.is_committed());
    assert_eq!(store.state().age, 5);
    assert!(store.state().tags.is_empty());
    assert!(throttled.is_pending());

    clock.advance(Duration::from_millis(100));
    throttled.poll().unwrap().unwrap();
    assert_eq!(
        *store.state(),
        Profile {
            name: "b".into(),
            age: 5,
            tags: vec!["x".into()],
        }
    );
    assert!(!throttled.is_pending());
}

struct PaymentGuard;

impl StorePlugin<Checkout> for PaymentGuard {
    fn name(&self) -> &str {
        "payment-guard"
    }

    fn on_before_change(&self, ctx: &PluginContext<'_, Checkout>) -> Result<Decision, PluginError> {
        Ok(if ctx.action == "setPaymentMethod" {
            Decision::Veto
        } else {
            Decision::Proceed
        })
    }
}

#[test]
fn plugin_vetoes_payment_method_change() {
    let store = StoreContext::new()
        .create_store(
            StoreConfig::<Checkout>::new("checkout").plugin(Rc::new(PaymentGuard)),
            || Checkout {
                payment_method: None,
                step: 1,
            },
        )
        .unwrap();
    let before = store.state();

    let outcome = store
        .merge("setPaymentMethod", json!({"payment_method": "card"}))
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::NoChange(Reason::Vetoed {
            plugin: "payment-guard".into()
        })
    );
    assert!(Rc::ptr_eq(&before, &store.state()));
    assert_eq!(store.version(), 0);

    assert!(
        store
            .merge("nextStep", json!({"step": 2}))
            .unwrap()
            .is_committed()
    );
}

#[test]
fn diff_reports_removed_and_added_keys() {
    let diff = TimeTravelRecorder::diff(&json!({"a": 1, "b": 2}), &json!({"a": 1, "c": 3}));
    assert_eq!(
        diff,
        vec![
            StateDiff {
                path: "b".into(),
                kind: DiffKind::Removed,
                old_value: Some(json!(2)),
                new_value: None,
            },
            StateDiff {
                path: "c".into(),
                kind: DiffKind::Added,
                old_value: None,
                new_value: Some(json!(3)),
            },
        ]
    );
}
