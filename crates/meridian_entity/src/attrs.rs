//! Entity attribute trees.
//!
//! An attribute tree is an ordered mapping from string keys to values, where
//! a value is a scalar, a nested mapping, or an ordered list. Subtrees are
//! addressed by *attribute paths*.
//!
//! **Path orientation (wire contract):** a path names the ancestors of the
//! addressed key starting from the leaf's parent and ending at the root-level
//! key. Resolution therefore walks the path **in reverse**, starting at the
//! attribute root. `set(path=["bag"], key="gold")` writes `attrs.bag.gold`,
//! and the *root key* of that change; the key that selects visibility and
//! the observer callback; is the last path element, `"bag"` (or `key`
//! itself when the path is empty). Tests pin this orientation.

use std::collections::BTreeMap;

use meridian_proto::Value;

use crate::entity::EntityError;

/// One recorded attribute mutation.
///
/// Changes are produced in application order and consumed exactly once by the
/// runtime's flush pass (journal, client delta, observer callback).
#[derive(Debug, Clone, PartialEq)]
pub enum AttrChange {
    /// A leaf or subtree was replaced or inserted.
    Set {
        path: Vec<String>,
        key: String,
        value: Value,
    },
    /// A key was removed.
    Del { path: Vec<String>, key: String },
    /// A value was appended to an ordered list.
    ListAppend {
        path: Vec<String>,
        key: String,
        value: Value,
    },
    /// The last value was popped from an ordered list.
    ListPop { path: Vec<String>, key: String },
}

impl AttrChange {
    /// The root-level key this change falls under.
    ///
    /// This is the key that decides client visibility and which
    /// `on_attr_change` observer fires.
    pub fn root_key(&self) -> &str {
        let (path, key) = match self {
            AttrChange::Set { path, key, .. }
            | AttrChange::Del { path, key }
            | AttrChange::ListAppend { path, key, .. }
            | AttrChange::ListPop { path, key } => (path, key),
        };
        path.last().map(String::as_str).unwrap_or(key)
    }
}

/// The attribute tree of a single entity, with change tracking.
///
/// Owned exclusively by the entity's serial context; nothing else mutates it.
#[derive(Debug, Default)]
pub struct AttrTree {
    root: BTreeMap<String, Value>,
    changes: Vec<AttrChange>,
}

impl AttrTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a tree from a decoded snapshot, with no pending changes.
    ///
    /// Used when loading from storage and when restoring a migrated entity.
    pub fn from_snapshot(root: BTreeMap<String, Value>) -> Self {
        Self {
            root,
            changes: Vec::new(),
        }
    }

    /// The tree as a single [`Value::Map`], for persistence and migration.
    pub fn snapshot(&self) -> Value {
        Value::Map(self.root.clone())
    }

    /// Reads the value at `path`/`key`, if present.
    pub fn get(&self, path: &[String], key: &str) -> Option<&Value> {
        let mut node = &self.root;
        for segment in path.iter().rev() {
            node = node.get(segment)?.as_map()?;
        }
        node.get(key)
    }

    /// Reads a root-level value.
    pub fn get_root(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Replaces (or inserts) the value at `path`/`key`.
    pub fn set(&mut self, path: &[String], key: &str, value: Value) -> Result<(), EntityError> {
        let node = self.resolve_mut(path)?;
        node.insert(key.to_string(), value.clone());
        self.changes.push(AttrChange::Set {
            path: path.to_vec(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Removes the value at `path`/`key`. Removing a missing key is not an
    /// error; no change is recorded for it.
    pub fn del(&mut self, path: &[String], key: &str) -> Result<(), EntityError> {
        let node = self.resolve_mut(path)?;
        if node.remove(key).is_some() {
            self.changes.push(AttrChange::Del {
                path: path.to_vec(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Appends `value` to the list at `path`/`key`, creating the list if the
    /// key is absent.
    pub fn list_append(&mut self, path: &[String], key: &str, value: Value) -> Result<(), EntityError> {
        let node = self.resolve_mut(path)?;
        let slot = node.entry(key.to_string()).or_insert_with(Value::list);
        match slot {
            Value::List(items) => items.push(value.clone()),
            other => {
                return Err(EntityError::AttrPath {
                    detail: format!("{key:?} holds {other:?}, not a list"),
                })
            }
        }
        self.changes.push(AttrChange::ListAppend {
            path: path.to_vec(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    /// Pops the last value from the list at `path`/`key`.
    pub fn list_pop(&mut self, path: &[String], key: &str) -> Result<Value, EntityError> {
        let node = self.resolve_mut(path)?;
        let popped = match node.get_mut(key) {
            Some(Value::List(items)) => items.pop().ok_or_else(|| EntityError::AttrPath {
                detail: format!("{key:?} is empty"),
            })?,
            Some(other) => {
                return Err(EntityError::AttrPath {
                    detail: format!("{key:?} holds {other:?}, not a list"),
                })
            }
            None => {
                return Err(EntityError::AttrPath {
                    detail: format!("{key:?} not found"),
                })
            }
        };
        self.changes.push(AttrChange::ListPop {
            path: path.to_vec(),
            key: key.to_string(),
        });
        Ok(popped)
    }

    /// Takes all changes recorded since the last call, in application order.
    pub fn take_changes(&mut self) -> Vec<AttrChange> {
        std::mem::take(&mut self.changes)
    }

    /// Whether any changes are pending.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    // Walks the path in reverse from the root, yielding the map the final
    // key lives in. Intermediate maps are created on demand.
    fn resolve_mut(&mut self, path: &[String]) -> Result<&mut BTreeMap<String, Value>, EntityError> {
        let mut node = &mut self.root;
        for segment in path.iter().rev() {
            let slot = node.entry(segment.clone()).or_insert_with(Value::map);
            node = match slot {
                Value::Map(m) => m,
                other => {
                    return Err(EntityError::AttrPath {
                        detail: format!("path segment {segment:?} holds {other:?}, not a map"),
                    })
                }
            };
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn root_level_set_and_get() {
        let mut tree = AttrTree::new();
        tree.set(&[], "hp", Value::Int(10)).expect("set");
        assert_eq!(tree.get(&[], "hp"), Some(&Value::Int(10)));
        assert_eq!(tree.get_root("hp"), Some(&Value::Int(10)));
    }

    // Pins the orientation contract: the path lists ancestors leaf-parent
    // first, and resolution walks it in reverse from the root.
    #[test]
    fn nested_path_resolves_root_last() {
        let mut tree = AttrTree::new();
        // attrs.outer.inner.leaf = 7, addressed as path [inner, outer].
        tree.set(&path(&["inner", "outer"]), "leaf", Value::Int(7)).expect("set");

        let outer = tree.get_root("outer").expect("outer").as_map().expect("map");
        let inner = outer.get("inner").expect("inner").as_map().expect("map");
        assert_eq!(inner.get("leaf"), Some(&Value::Int(7)));
    }

    #[test]
    fn root_key_is_last_path_element() {
        let change = AttrChange::Set {
            path: path(&["inner", "outer"]),
            key: "leaf".into(),
            value: Value::Int(1),
        };
        assert_eq!(change.root_key(), "outer");

        let change = AttrChange::Set {
            path: vec![],
            key: "hp".into(),
            value: Value::Int(1),
        };
        assert_eq!(change.root_key(), "hp");
    }

    #[test]
    fn changes_are_recorded_in_order() {
        let mut tree = AttrTree::new();
        tree.set(&[], "hp", Value::Int(10)).expect("set");
        tree.set(&path(&["bag"]), "gold", Value::Int(5)).expect("set");
        tree.list_append(&[], "log", Value::Str("a".into())).expect("append");
        tree.list_pop(&[], "log").expect("pop");
        tree.del(&[], "hp").expect("del");

        let changes = tree.take_changes();
        assert_eq!(changes.len(), 5);
        assert!(matches!(&changes[0], AttrChange::Set { key, .. } if key == "hp"));
        assert!(matches!(&changes[1], AttrChange::Set { key, .. } if key == "gold"));
        assert!(matches!(&changes[2], AttrChange::ListAppend { .. }));
        assert!(matches!(&changes[3], AttrChange::ListPop { .. }));
        assert!(matches!(&changes[4], AttrChange::Del { key, .. } if key == "hp"));
        assert!(!tree.has_changes());
    }

    #[test]
    fn deleting_missing_key_records_nothing() {
        let mut tree = AttrTree::new();
        tree.del(&[], "ghost").expect("del");
        assert!(!tree.has_changes());
    }

    #[test]
    fn list_ops_enforce_list_type() {
        let mut tree = AttrTree::new();
        tree.set(&[], "scalar", Value::Int(1)).expect("set");
        assert!(tree.list_append(&[], "scalar", Value::Int(2)).is_err());
        assert!(tree.list_pop(&[], "scalar").is_err());
        assert!(tree.list_pop(&[], "missing").is_err());
    }

    #[test]
    fn pop_returns_last_appended() {
        let mut tree = AttrTree::new();
        tree.list_append(&[], "stack", Value::Int(1)).expect("append");
        tree.list_append(&[], "stack", Value::Int(2)).expect("append");
        assert_eq!(tree.list_pop(&[], "stack").expect("pop"), Value::Int(2));
    }

    #[test]
    fn snapshot_restores_identically() {
        let mut tree = AttrTree::new();
        tree.set(&[], "hp", Value::Int(10)).expect("set");
        tree.set(&path(&["bag"]), "gold", Value::Int(5)).expect("set");
        tree.take_changes();

        let snap = tree.snapshot();
        let raw = snap.encode_to_vec();
        let decoded = Value::decode_from_slice(&raw).expect("decode");
        let restored = match decoded {
            Value::Map(m) => AttrTree::from_snapshot(m),
            other => panic!("snapshot must be a map, got {other:?}"),
        };
        assert_eq!(restored.snapshot().encode_to_vec(), raw);
        assert!(!restored.has_changes());
    }

    #[test]
    fn path_through_non_map_is_an_error() {
        let mut tree = AttrTree::new();
        tree.set(&[], "leafy", Value::Int(3)).expect("set");
        let err = tree.set(&path(&["leafy"]), "x", Value::Int(1)).unwrap_err();
        assert!(matches!(err, EntityError::AttrPath { .. }));
    }
}
