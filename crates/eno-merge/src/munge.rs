use serde_json::Value;

/// Prepare a computed patch for transmission: drop `creationTimestamp`
/// (the server owns it; serializers emit nulls that would otherwise count
/// as changes), stamp `metadata.resourceVersion` for optimistic
/// concurrency, and detect no-ops — a patch whose payload beyond the
/// resourceVersion is empty returns `None`.
pub fn munge_patch(mut patch: Value, resource_version: Option<&str>) -> Option<Value> {
    let mut drop_metadata = false;
    if let Some(metadata) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("creationTimestamp");
        metadata.remove("resourceVersion");
        drop_metadata = metadata.is_empty();
    }
    if drop_metadata {
        if let Some(m) = patch.as_object_mut() {
            m.remove("metadata");
        }
    }

    if patch.as_object().map_or(true, |m| m.is_empty()) {
        return None;
    }

    if let Some(rv) = resource_version {
        let obj = patch.as_object_mut()?;
        let metadata = obj
            .entry("metadata")
            .or_insert(Value::Object(Default::default()));
        if let Some(m) = metadata.as_object_mut() {
            m.insert("resourceVersion".into(), Value::String(rv.to_string()));
        }
    }
    Some(patch)
}
