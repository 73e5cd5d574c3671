use serde_json::Value;

use crate::path::FieldPathSegment;

/// A parsed `fieldsV1` ownership set from one `managedFields` entry.
///
/// The wire format is a trie of JSON objects whose keys are prefixed
/// segment encodings: `f:<name>` for object fields, `k:{…}` for keyed list
/// members, `v:<json>` for atomic list members, and `.` marking ownership
/// of the node itself.
#[derive(Debug, Clone, Default)]
pub struct FieldSet {
    root: Value,
}

impl FieldSet {
    pub fn parse(fields_v1: &Value) -> Self {
        FieldSet {
            root: fields_v1.clone(),
        }
    }

    /// Whether `path` is a member of this set: the walk must land on an
    /// existing node. Owning a node implies owning the subtree rooted there
    /// for the purposes of this query.
    pub fn contains(&self, path: &[FieldPathSegment]) -> bool {
        node_contains(&self.root, path)
    }

    pub fn is_empty(&self) -> bool {
        self.root.as_object().map_or(true, |m| m.is_empty())
    }

    pub fn into_value(self) -> Value {
        self.root
    }
}

fn node_contains(node: &Value, path: &[FieldPathSegment]) -> bool {
    let map = match node.as_object() {
        Some(m) => m,
        None => return false,
    };
    let (segment, rest) = match path.split_first() {
        Some(split) => split,
        None => return true,
    };

    match segment {
        FieldPathSegment::Field(name) => map
            .get(&format!("f:{}", name))
            .map_or(false, |child| node_contains(child, rest)),
        FieldPathSegment::Key { key, value } => map.iter().any(|(k, child)| {
            key_entry_matches(k, key, value) && node_contains(child, rest)
        }),
        FieldPathSegment::AnyItem => map.iter().any(|(k, child)| {
            (k.starts_with("k:") || k.starts_with("v:")) && node_contains(child, rest)
        }),
    }
}

/// Match a `k:{…}` trie key against a single `key=value` constraint. The
/// encoded merge key object may carry additional keys (e.g. both port and
/// protocol); a single matching entry suffices.
fn key_entry_matches(trie_key: &str, key: &str, value: &str) -> bool {
    let Some(encoded) = trie_key.strip_prefix("k:") else {
        return false;
    };
    let Ok(parsed) = serde_json::from_str::<Value>(encoded) else {
        return false;
    };
    match parsed.get(key) {
        Some(Value::String(s)) => s == value,
        Some(Value::Number(n)) => n.to_string() == value,
        Some(Value::Bool(b)) => b.to_string() == value,
        _ => false,
    }
}

/// Remove `path` (and the subtree below it) from a raw `fieldsV1` value.
/// Emptied intermediate nodes are pruned. Returns whether anything was
/// removed.
pub fn remove_field_path(fields_v1: &mut Value, path: &[FieldPathSegment]) -> bool {
    let map = match fields_v1.as_object_mut() {
        Some(m) => m,
        None => return false,
    };
    let (segment, rest) = match path.split_first() {
        Some(split) => split,
        None => return false,
    };

    let keys: Vec<String> = map
        .keys()
        .filter(|k| match segment {
            FieldPathSegment::Field(name) => k.as_str() == format!("f:{}", name),
            FieldPathSegment::Key { key, value } => key_entry_matches(k, key, value),
            FieldPathSegment::AnyItem => k.starts_with("k:") || k.starts_with("v:"),
        })
        .cloned()
        .collect();

    let mut removed = false;
    for k in keys {
        if rest.is_empty() {
            map.remove(&k);
            removed = true;
            continue;
        }
        if let Some(child) = map.get_mut(&k) {
            if remove_field_path(child, rest) {
                removed = true;
                if child.as_object().is_some_and(|m| m.is_empty()) {
                    map.remove(&k);
                }
            }
        }
    }
    removed
}

/// The `pathManagedByEno` predicate: whether `path` is owned by entries of
/// `managed_fields` (the raw `metadata.managedFields` array) whose manager
/// equals `manager`. A missing or malformed array yields `false`.
pub fn path_managed_by(
    manager: &str,
    managed_fields: &Value,
    path: &[FieldPathSegment],
) -> bool {
    let entries = match managed_fields.as_array() {
        Some(a) => a,
        None => return false,
    };
    entries
        .iter()
        .filter(|e| e.get("manager").and_then(Value::as_str) == Some(manager))
        .filter_map(|e| e.get("fieldsV1"))
        .any(|fields| FieldSet::parse(fields).contains(path))
}
