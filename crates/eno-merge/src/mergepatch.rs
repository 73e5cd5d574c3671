use serde_json::{Map, Value};

/// Compute an RFC 7386 merge patch with three-way semantics: changes are
/// desired-vs-current, deletions are prev-vs-desired (emitted only while
/// the field still exists in current). Arrays replace wholesale — kinds
/// without a strategic-merge schema get no per-element semantics.
pub fn three_way_merge(prev: &Value, desired: &Value, current: &Value) -> Value {
    let empty = Map::new();
    let prev = prev.as_object().unwrap_or(&empty);
    let desired = desired.as_object().cloned().unwrap_or_default();
    let current = current.as_object().cloned().unwrap_or_default();
    Value::Object(diff(prev, &desired, &current))
}

fn diff(
    prev: &Map<String, Value>,
    desired: &Map<String, Value>,
    current: &Map<String, Value>,
) -> Map<String, Value> {
    let empty = Map::new();
    let mut patch = Map::new();

    for (key, want) in desired {
        let cur = current.get(key);
        match (want, cur) {
            (Value::Object(want_map), Some(Value::Object(cur_map))) => {
                let prev_map = prev.get(key).and_then(Value::as_object).unwrap_or(&empty);
                let sub = diff(prev_map, want_map, cur_map);
                if !sub.is_empty() {
                    patch.insert(key.clone(), Value::Object(sub));
                }
            }
            _ => {
                if cur != Some(want) {
                    patch.insert(key.clone(), want.clone());
                }
            }
        }
    }

    for key in prev.keys() {
        if !desired.contains_key(key) && current.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    patch
}

/// RFC 7386 application, used by the in-memory downstream fake.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
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
                let slot = target_map
                    .entry(key.clone())
                    .or_insert(Value::Object(Map::new()));
                apply_merge_patch(slot, pv);
            }
            _ => {
                target_map.insert(key.clone(), pv.clone());
            }
        }
    }
}
