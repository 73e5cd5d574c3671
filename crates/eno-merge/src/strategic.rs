use std::collections::HashMap;

use serde_json::{Map, Value};

/// Directive key used by strategic merge patches to mark list-element
/// deletions.
const PATCH_DIRECTIVE: &str = "$patch";

// ── Merge metadata ────────────────────────────────────────────────────────────

/// Source of list-merge semantics, resolved from the downstream OpenAPI
/// schema. `None` for a list means it merges atomically.
pub trait MergeMetadata {
    /// Merge key for the list at `path` — field names from the object root,
    /// list levels not represented (e.g. `["spec", "ports"]`).
    fn list_merge_key(&self, path: &[&str]) -> Option<String>;
}

/// Fixed path → merge-key table; used by tests and the local fake server.
#[derive(Debug, Clone, Default)]
pub struct StaticMergeKeys {
    keys: HashMap<String, String>,
}

impl StaticMergeKeys {
    pub fn new(entries: &[(&str, &str)]) -> Self {
        StaticMergeKeys {
            keys: entries
                .iter()
                .map(|(p, k)| (p.to_string(), k.to_string()))
                .collect(),
        }
    }
}

impl MergeMetadata for StaticMergeKeys {
    fn list_merge_key(&self, path: &[&str]) -> Option<String> {
        self.keys.get(&path.join(".")).cloned()
    }
}

// ── Three-way strategic merge ─────────────────────────────────────────────────

/// Compute a strategic merge patch that moves `current` to `desired`:
/// additions and changes are taken from desired-vs-current, deletions from
/// prev-vs-desired (and only emitted while the field still exists in
/// current). Lists with a merge key diff per element and use `$patch:
/// delete` directives; lists without one replace atomically. An empty
/// result object means nothing to do.
pub fn three_way_strategic(
    prev: &Value,
    desired: &Value,
    current: &Value,
    meta: &dyn MergeMetadata,
) -> Value {
    let empty = Map::new();
    let prev = prev.as_object().unwrap_or(&empty);
    let desired_map = desired.as_object().cloned().unwrap_or_default();
    let current_map = current.as_object().cloned().unwrap_or_default();
    Value::Object(diff_objects(prev, &desired_map, &current_map, meta, &mut Vec::new()))
}

fn diff_objects(
    prev: &Map<String, Value>,
    desired: &Map<String, Value>,
    current: &Map<String, Value>,
    meta: &dyn MergeMetadata,
    path: &mut Vec<String>,
) -> Map<String, Value> {
    let mut patch = Map::new();
    let empty = Map::new();

    for (key, want) in desired {
        let cur = current.get(key);
        match (want, cur) {
            (Value::Object(want_map), Some(Value::Object(cur_map))) => {
                let prev_map = prev
                    .get(key)
                    .and_then(Value::as_object)
                    .unwrap_or(&empty);
                path.push(key.clone());
                let sub = diff_objects(prev_map, want_map, cur_map, meta, path);
                path.pop();
                if !sub.is_empty() {
                    patch.insert(key.clone(), Value::Object(sub));
                }
            }
            (Value::Array(want_list), _) => {
                path.push(key.clone());
                let path_refs: Vec<&str> = path.iter().map(String::as_str).collect();
                let merge_key = meta.list_merge_key(&path_refs);
                let entry = match merge_key {
                    Some(ref mk) if keyed_list(want_list, mk) => {
                        let prev_list = prev
                            .get(key)
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        let cur_list = cur
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        let merged =
                            diff_keyed_list(&prev_list, want_list, &cur_list, mk, meta, path);
                        if merged.is_empty() {
                            None
                        } else {
                            Some(Value::Array(merged))
                        }
                    }
                    // Atomic list: replace wholesale when it differs.
                    _ => (cur != Some(want)).then(|| want.clone()),
                };
                path.pop();
                if let Some(v) = entry {
                    patch.insert(key.clone(), v);
                }
            }
            // Scalars, objects replacing non-objects, and fields missing
            // from current: set outright when different.
            _ => {
                if cur != Some(want) {
                    patch.insert(key.clone(), want.clone());
                }
            }
        }
    }

    // Deletions: owned previously, dropped from desired, still present.
    for key in prev.keys() {
        if !desired.contains_key(key) && current.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    patch
}

/// Every element must be a map carrying the merge key; otherwise the list
/// falls back to atomic replacement.
fn keyed_list(list: &[Value], merge_key: &str) -> bool {
    list.iter()
        .all(|el| el.as_object().map_or(false, |m| m.contains_key(merge_key)))
}

fn diff_keyed_list(
    prev: &[Value],
    desired: &[Value],
    current: &[Value],
    merge_key: &str,
    meta: &dyn MergeMetadata,
    path: &mut Vec<String>,
) -> Vec<Value> {
    let empty = Map::new();
    let mut out = Vec::new();

    for want in desired {
        let want_map = match want.as_object() {
            Some(m) => m,
            None => continue,
        };
        let key_value = match want_map.get(merge_key) {
            Some(v) => v,
            None => continue,
        };
        match find_by_key(current, merge_key, key_value) {
            None => out.push(want.clone()),
            Some(cur_el) => {
                let cur_map = cur_el.as_object().unwrap_or(&empty);
                let prev_map = find_by_key(prev, merge_key, key_value)
                    .and_then(Value::as_object)
                    .unwrap_or(&empty);
                let mut sub = diff_objects(prev_map, want_map, cur_map, meta, path);
                if !sub.is_empty() {
                    // Element patches address their target by merge key.
                    sub.insert(merge_key.to_string(), key_value.clone());
                    out.push(Value::Object(sub));
                }
            }
        }
    }

    for prev_el in prev {
        let key_value = match prev_el.get(merge_key) {
            Some(v) => v,
            None => continue,
        };
        let dropped = find_by_key(desired, merge_key, key_value).is_none();
        let still_present = find_by_key(current, merge_key, key_value).is_some();
        if dropped && still_present {
            let mut directive = Map::new();
            directive.insert(PATCH_DIRECTIVE.to_string(), Value::String("delete".into()));
            directive.insert(merge_key.to_string(), key_value.clone());
            out.push(Value::Object(directive));
        }
    }

    out
}

fn find_by_key<'a>(list: &'a [Value], merge_key: &str, value: &Value) -> Option<&'a Value> {
    list.iter().find(|el| el.get(merge_key) == Some(value))
}

// ── Strategic patch application ───────────────────────────────────────────────

/// Apply a strategic merge patch to `target` in place. Mirrors the compute
/// half above: nulls delete, keyed lists merge per element and honor
/// `$patch: delete`, atomic lists replace.
pub fn apply_strategic_patch(target: &mut Value, patch: &Value, meta: &dyn MergeMetadata) {
    let mut path = Vec::new();
    apply_object(target, patch, meta, &mut path);
}

fn apply_object(
    target: &mut Value,
    patch: &Value,
    meta: &dyn MergeMetadata,
    path: &mut Vec<String>,
) {
    let patch_map = match patch.as_object() {
        Some(m) => m,
        None => {
            *target = patch.clone();
            return;
        }
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let target_map = match target.as_object_mut() {
        Some(m) => m,
        None => return,
    };

    for (key, pv) in patch_map {
        match pv {
            Value::Null => {
                target_map.remove(key);
            }
            Value::Object(_) => {
                path.push(key.clone());
                let slot = target_map.entry(key.clone()).or_insert(Value::Object(Map::new()));
                apply_object(slot, pv, meta, path);
                path.pop();
            }
            Value::Array(items) => {
                path.push(key.clone());
                let path_refs: Vec<&str> = path.iter().map(String::as_str).collect();
                match meta.list_merge_key(&path_refs) {
                    Some(mk) if items.iter().all(|el| el.is_object()) => {
                        let existing = target_map
                            .get(key)
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        let merged = apply_keyed_list(existing, items, &mk, meta, path);
                        target_map.insert(key.clone(), Value::Array(merged));
                    }
                    _ => {
                        target_map.insert(key.clone(), pv.clone());
                    }
                }
                path.pop();
            }
            _ => {
                target_map.insert(key.clone(), pv.clone());
            }
        }
    }
}

fn apply_keyed_list(
    mut existing: Vec<Value>,
    patch_items: &[Value],
    merge_key: &str,
    meta: &dyn MergeMetadata,
    path: &mut Vec<String>,
) -> Vec<Value> {
    for item in patch_items {
        let item_map = match item.as_object() {
            Some(m) => m,
            None => continue,
        };
        let key_value = match item_map.get(merge_key) {
            Some(v) => v.clone(),
            None => continue,
        };
        if item_map.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete") {
            existing.retain(|el| el.get(merge_key) != Some(&key_value));
            continue;
        }
        match existing
            .iter_mut()
            .find(|el| el.get(merge_key) == Some(&key_value))
        {
            Some(el) => apply_object(el, item, meta, path),
            None => existing.push(item.clone()),
        }
    }
    existing
}
