#![forbid(unsafe_code)]

//! Structural diffing of state snapshots.
//!
//! States are compared through their JSON projection, so any `Serialize`
//! state can be diffed without extra trait impls.
//!
//! # Rules
//!
//! - A key present on one side only yields one `Added` or `Removed` entry.
//! - Objects and arrays present on both sides are walked recursively; arrays
//!   compare index by index and surplus indices are `Added`/`Removed`.
//! - Any other inequality, including a kind mismatch such as object vs array
//!   or number vs string, is a single `Changed` entry at that path.
//! - Equal inputs yield no entries.
//!
//! Paths are dotted: `"user.name"`, `"items.2"`. The root path is `""`.
//! Object keys are visited in the previous value's order, then keys that only
//! exist in the next value.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    /// Present only in the next state.
    Added,
    /// Present only in the previous state.
    Removed,
    /// Present in both with different leaf values.
    Changed,
}

/// One divergence between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Dotted path of the divergence.
    pub path: String,
    /// Kind of divergence.
    pub kind: DiffKind,
    /// Previous value (absent for `Added`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Next value (absent for `Removed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl StateDiff {
    fn added(path: String, value: &Value) -> Self {
        Self {
            path,
            kind: DiffKind::Added,
            old_value: None,
            new_value: Some(value.clone()),
        }
    }

    fn removed(path: String, value: &Value) -> Self {
        Self {
            path,
            kind: DiffKind::Removed,
            old_value: Some(value.clone()),
            new_value: None,
        }
    }

    fn changed(path: String, old: &Value, new: &Value) -> Self {
        Self {
            path,
            kind: DiffKind::Changed,
            old_value: Some(old.clone()),
            new_value: Some(new.clone()),
        }
    }
}

impl fmt::Display for StateDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "<root>" } else { &self.path };
        match (&self.old_value, &self.new_value) {
            (Some(old), Some(new)) => write!(f, "~ {path}: {old} -> {new}"),
            (None, Some(new)) => write!(f, "+ {path}: {new}"),
            (Some(old), None) => write!(f, "- {path}: {old}"),
            (None, None) => write!(f, "? {path}"),
        }
    }
}

/// Diff two JSON values.
#[must_use]
pub fn diff(prev: &Value, next: &Value) -> Vec<StateDiff> {
    let mut out = Vec::new();
    walk(String::new(), prev, next, &mut out);
    out
}

/// Diff two serializable states.
///
/// # Errors
///
/// Returns the serialization error if either state cannot be projected.
pub fn diff_states<S: Serialize>(prev: &S, next: &S) -> Result<Vec<StateDiff>, serde_json::Error> {
    Ok(diff(&serde_json::to_value(prev)?, &serde_json::to_value(next)?))
}

fn join(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{base}.{segment}")
    }
}

fn walk(path: String, prev: &Value, next: &Value, out: &mut Vec<StateDiff>) {
    if prev == next {
        return;
    }
    match (prev, next) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, old) in a {
                let child = join(&path, key);
                match b.get(key) {
                    Some(new) => walk(child, old, new, out),
                    None => out.push(StateDiff::removed(child, old)),
                }
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    out.push(StateDiff::added(join(&path, key), new));
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for (index, old) in a.iter().enumerate() {
                let child = join(&path, &index.to_string());
                match b.get(index) {
                    Some(new) => walk(child, old, new, out),
                    None => out.push(StateDiff::removed(child, old)),
                }
            }
            for (index, new) in b.iter().enumerate().skip(a.len()) {
                out.push(StateDiff::added(join(&path, &index.to_string()), new));
            }
        }
        _ => out.push(StateDiff::changed(path, prev, next)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn added_and_removed_keys() {
        let d = diff(&json!({"a": 1, "b": 2}), &json!({"a": 1, "c": 3}));
        assert_eq!(
            d,
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

    #[test]
    fn nested_change_reported_at_leaf() {
        let d = diff(
            &json!({"user": {"name": "ada", "age": 36}}),
            &json!({"user": {"name": "ada", "age": 37}}),
        );
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "user.age");
        assert_eq!(d[0].kind, DiffKind::Changed);
        assert_eq!(d[0].old_value, Some(json!(36)));
        assert_eq!(d[0].new_value, Some(json!(37)));
    }

    #[test]
    fn arrays_compare_by_index() {
        let d = diff(&json!({"items": [1, 2]}), &json!({"items": [1, 5, 9]}));
        let paths: Vec<_> = d.iter().map(|e| (e.path.as_str(), e.kind)).collect();
        assert_eq!(
            paths,
            vec![("items.1", DiffKind::Changed), ("items.2", DiffKind::Added)]
        );

        let shrunk = diff(&json!([1, 2, 3]), &json!([1]));
        assert_eq!(shrunk.len(), 2);
        assert!(shrunk.iter().all(|e| e.kind == DiffKind::Removed));
        assert_eq!(shrunk[0].path, "1");
    }

    #[test]
    fn kind_mismatch_is_single_change() {
        let d = diff(&json!({"v": {"x": 1}}), &json!({"v": [1]}));
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "v");
        assert_eq!(d[0].kind, DiffKind::Changed);

        let root = diff(&json!(1), &json!("1"));
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].path, "");
    }

    #[test]
    fn display_marks_kind() {
        let d = diff(&json!({"a": 1, "b": 2}), &json!({"a": 2, "c": 3}));
        let lines: Vec<_> = d.iter().map(ToString::to_string).collect();
        assert_eq!(lines, vec!["~ a: 1 -> 2", "- b: 2", "+ c: 3"]);
    }

    #[test]
    fn diff_states_projects_through_serde() {
        #[derive(Serialize)]
        struct Counter {
            count: u32,
        }
        let d = diff_states(&Counter { count: 1 }, &Counter { count: 2 }).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].path, "count");
    }

    #[test]
    fn serializes_kind_lowercase() {
        let d = diff(&json!({}), &json!({"k": true}));
        let encoded = serde_json::to_value(&d[0]).unwrap();
        assert_eq!(
            encoded,
            json!({"path": "k", "kind": "added", "new_value": true})
        );
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::from),
        ]
    }

    fn tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-d]", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn diff_with_self_is_empty(v in tree()) {
            prop_assert!(diff(&v, &v).is_empty());
        }

        #[test]
        fn empty_diff_iff_equal(a in tree(), b in tree()) {
            prop_assert_eq!(diff(&a, &b).is_empty(), a == b);
        }

        #[test]
        fn paths_are_unique(a in tree(), b in tree()) {
            let d = diff(&a, &b);
            let mut paths: Vec<_> = d.iter().map(|e| e.path.clone()).collect();
            paths.sort();
            paths.dedup();
            prop_assert_eq!(paths.len(), d.len());
        }
    }
}
