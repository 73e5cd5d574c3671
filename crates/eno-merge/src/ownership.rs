use serde_json::Value;

use eno_expr::{remove_field_path, FieldSet, PathExpr, Section};

/// Who owns a nominated scope of an object, computed from
/// `metadata.managedFields`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipStatus {
    /// The scope exists, this engine owns it, and nobody else does.
    pub fully_owned_by_eno: bool,
    /// Other managers owning (part of) the scope via server-side apply.
    /// These can be displaced with a forced apply.
    pub other_apply_managers: Vec<String>,
    /// Other managers owning (part of) the scope via update. Force-apply
    /// cannot take fields from these; their entries must be rewritten.
    pub other_update_managers: Vec<String>,
    /// Whether any manager records the scope at all.
    pub scope_exists: bool,
}

/// Analyze `metadata.managedFields` (the raw array) against a scope path.
pub fn analyze_ownership(
    managed_fields: &Value,
    scope: &PathExpr,
    eno_manager: &str,
) -> OwnershipStatus {
    let path = scope.to_field_path();
    let mut status = OwnershipStatus::default();
    let mut eno_owns = false;

    let entries = match managed_fields.as_array() {
        Some(a) => a,
        None => return status,
    };
    for entry in entries {
        let fields = match entry.get("fieldsV1") {
            Some(f) => f,
            None => continue,
        };
        if !FieldSet::parse(fields).contains(&path) {
            continue;
        }
        status.scope_exists = true;

        let manager = entry
            .get("manager")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if manager == eno_manager {
            eno_owns = true;
            continue;
        }
        match entry.get("operation").and_then(Value::as_str) {
            Some("Apply") => status.other_apply_managers.push(manager),
            _ => status.other_update_managers.push(manager),
        }
    }

    status.fully_owned_by_eno = status.scope_exists
        && eno_owns
        && status.other_apply_managers.is_empty()
        && status.other_update_managers.is_empty();
    status
}

/// Rewrite a `managedFields` array, removing the scope subtree from the
/// named managers' `fieldsV1` sets. Entries whose remaining set becomes
/// empty are dropped entirely. Returns `None` when nothing changed.
pub fn strip_scope_from(
    managed_fields: &Value,
    managers: &[String],
    scope: &PathExpr,
) -> Option<Value> {
    let path = scope.to_field_path();
    let entries = managed_fields.as_array()?;
    let mut out = Vec::with_capacity(entries.len());
    let mut changed = false;

    for entry in entries {
        let manager = entry.get("manager").and_then(Value::as_str).unwrap_or("");
        if !managers.iter().any(|m| m == manager) {
            out.push(entry.clone());
            continue;
        }
        let mut entry = entry.clone();
        let removed = entry
            .get_mut("fieldsV1")
            .map(|fields| remove_field_path(fields, &path))
            .unwrap_or(false);
        if !removed {
            out.push(entry);
            continue;
        }
        changed = true;
        let emptied = entry
            .get("fieldsV1")
            .and_then(Value::as_object)
            .map_or(false, |m| m.is_empty());
        if !emptied {
            out.push(entry);
        }
    }

    changed.then(|| Value::Array(out))
}

/// Build the minimal apply payload for force-taking a scope: the object's
/// identity plus just the scope subtree copied from the desired manifest.
/// Only plain field chains can be extracted; `None` otherwise, or when the
/// desired manifest doesn't carry the scope.
pub fn extract_scope(desired: &Value, scope: &PathExpr) -> Option<Value> {
    let mut names = Vec::new();
    for section in scope.sections() {
        match section {
            Section::Field(name) => names.push(name.clone()),
            _ => return None,
        }
    }

    let mut leaf = desired;
    for name in &names {
        leaf = leaf.get(name)?;
    }

    let mut payload = serde_json::json!({
        "apiVersion": desired.get("apiVersion")?,
        "kind": desired.get("kind")?,
        "metadata": {
            "name": desired.pointer("/metadata/name")?,
        },
    });
    if let Some(ns) = desired.pointer("/metadata/namespace") {
        payload["metadata"]["namespace"] = ns.clone();
    }

    // Wrap the leaf back up along the path.
    let mut nested = leaf.clone();
    for name in names.iter().rev() {
        let mut wrapper = serde_json::Map::new();
        wrapper.insert(name.clone(), nested);
        nested = Value::Object(wrapper);
    }
    if let (Some(obj), Some(wrap)) = (payload.as_object_mut(), nested.as_object()) {
        for (k, v) in wrap {
            obj.insert(k.clone(), v.clone());
        }
    }
    Some(payload)
}
