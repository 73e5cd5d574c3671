use serde_json::{json, Value};
use tracing::debug;

use eno_domain::{annotations, Composition, Resource, FIELD_MANAGER};
use eno_expr::{path_managed_by, Context};

use crate::error::ReconcileError;

/// Apply a resource's overrides against the live downstream object and
/// return the effective desired manifest plus the effective replace flag
/// (an override may set or clear the replace annotation).
pub fn apply_overrides(
    resource: &Resource,
    composition: &Composition,
    live: &Value,
) -> Result<(Value, bool), ReconcileError> {
    let mut desired = resource.parsed.clone();
    let managed_fields = live
        .pointer("/metadata/managedFields")
        .cloned()
        .unwrap_or(Value::Null);

    for (i, o) in resource.overrides.iter().enumerate() {
        let applies = match &o.condition {
            None => true,
            Some(condition) => {
                let field_path = o.path.to_field_path();
                let managed = &managed_fields;
                let ctx = Context::new(live)
                    .with_composition(|| composition_view(composition))
                    .with_path_managed_by_eno(move || {
                        path_managed_by(FIELD_MANAGER, managed, &field_path)
                    });
                // A condition that fails to evaluate simply doesn't fire;
                // user expressions must not wedge the reconciler.
                match condition.eval_bool(&ctx) {
                    Ok(b) => b,
                    Err(e) => {
                        debug!(resource = %resource.resource_ref, index = i, error = %e,
                               "override condition did not evaluate");
                        false
                    }
                }
            }
        };
        if applies {
            o.path.apply(&mut desired, o.value.as_ref())?;
        }
    }

    let replace = effective_replace(&desired, resource.replace);
    strip_override_annotations(&mut desired);
    Ok((desired, replace))
}

/// Overrides may write the replace annotation into the manifest; when
/// present it wins over the ingest-time flag.
fn effective_replace(desired: &Value, parsed_default: bool) -> bool {
    desired
        .pointer("/metadata/annotations")
        .and_then(Value::as_object)
        .and_then(|a| a.get(annotations::REPLACE))
        .and_then(Value::as_str)
        .map(|v| v == "true")
        .unwrap_or(parsed_default)
}

/// Engine annotations written by overrides are interpreted, never sent
/// downstream.
fn strip_override_annotations(desired: &mut Value) {
    let Some(metadata) = desired.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let emptied = match metadata.get_mut("annotations").and_then(Value::as_object_mut) {
        Some(anns) => {
            anns.retain(|k, _| !annotations::is_eno_annotation(k));
            anns.is_empty()
        }
        None => return,
    };
    if emptied {
        metadata.remove("annotations");
    }
}

/// The view of the composition exposed to expressions.
pub fn composition_view(composition: &Composition) -> Value {
    let mut metadata = json!({
        "name": composition.metadata.name,
        "namespace": composition.metadata.namespace,
        "labels": composition.metadata.labels,
        "annotations": composition.metadata.annotations,
    });
    if let Some(ts) = &composition.metadata.deletion_timestamp {
        metadata["deletionTimestamp"] = json!(ts.to_rfc3339());
    }
    json!({ "metadata": metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_domain::{Manifest, NamespacedName};

    fn resource_with(doc: Value) -> Resource {
        Resource::from_manifest(
            NamespacedName::new("default", "slice-0"),
            0,
            &Manifest {
                manifest: doc.to_string(),
                deleted: false,
            },
        )
        .unwrap()
    }

    fn cm_with_overrides(ops: Value) -> Resource {
        resource_with(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "annotations": {
                "eno.azure.io/overrides": ops.to_string(),
            }},
            "data": {"foo": "eno-value"},
        }))
    }

    #[test]
    fn unconditional_override_always_applies() {
        let res = cm_with_overrides(json!([
            {"path": "self.data.foo", "value": "patched"},
        ]));
        let (desired, _) =
            apply_overrides(&res, &Composition::default(), &Value::Null).unwrap();
        assert_eq!(desired["data"]["foo"], "patched");
    }

    #[test]
    fn condition_sees_the_live_object() {
        // Keep the desired value only while the live object lacks the
        // field; an external write wins.
        let res = cm_with_overrides(json!([
            {"path": "self.data.foo", "value": null, "condition": "has(self.data.foo)"},
        ]));

        let live_without = json!({"data": {}});
        let (desired, _) = apply_overrides(&res, &Composition::default(), &live_without).unwrap();
        assert_eq!(desired["data"]["foo"], "eno-value");

        let live_with = json!({"data": {"foo": "external-value"}});
        let (desired, _) = apply_overrides(&res, &Composition::default(), &live_with).unwrap();
        assert!(desired["data"].get("foo").is_none());
    }

    #[test]
    fn condition_errors_do_not_fire() {
        let res = cm_with_overrides(json!([
            {"path": "self.data.foo", "value": "boom", "condition": "self.missing.deep == 1"},
        ]));
        let (desired, _) =
            apply_overrides(&res, &Composition::default(), &json!({})).unwrap();
        assert_eq!(desired["data"]["foo"], "eno-value");
    }

    #[test]
    fn condition_can_reference_the_composition() {
        let mut comp = Composition::default();
        comp.metadata.name = "prod".into();
        let res = cm_with_overrides(json!([
            {"path": "self.data.foo", "value": "prod-value",
             "condition": "composition.metadata.name == 'prod'"},
        ]));
        let (desired, _) = apply_overrides(&res, &comp, &json!({})).unwrap();
        assert_eq!(desired["data"]["foo"], "prod-value");
    }

    #[test]
    fn path_managed_by_eno_guard() {
        let res = cm_with_overrides(json!([
            {"path": "self.data.foo", "value": "take-back", "condition": "pathManagedByEno"},
        ]));

        let live_unowned = json!({"data": {"foo": "external"}, "metadata": {"managedFields": []}});
        let (desired, _) = apply_overrides(&res, &Composition::default(), &live_unowned).unwrap();
        assert_eq!(desired["data"]["foo"], "eno-value");

        let live_owned = json!({
            "data": {"foo": "mine"},
            "metadata": {"managedFields": [
                {"manager": "eno", "operation": "Apply",
                 "fieldsV1": {"f:data": {"f:foo": {}}}},
            ]},
        });
        let (desired, _) = apply_overrides(&res, &Composition::default(), &live_owned).unwrap();
        assert_eq!(desired["data"]["foo"], "take-back");
    }

    #[test]
    fn replace_annotation_can_be_set_by_override() {
        // The annotations map must survive ingest-time stripping for the
        // override to have somewhere to write (intermediate keys are never
        // materialized).
        let ops = json!([
            {"path": "self.metadata.annotations['eno.azure.io/replace']", "value": "true"},
        ]);
        let res = resource_with(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "annotations": {
                "eno.azure.io/overrides": ops.to_string(),
                "keep.example.com/x": "y",
            }},
            "data": {},
        }));
        assert!(!res.replace);
        let (desired, replace) =
            apply_overrides(&res, &Composition::default(), &json!({})).unwrap();
        assert!(replace);
        // The engine annotation itself never reaches the downstream manifest.
        assert_eq!(
            desired.pointer("/metadata/annotations").unwrap(),
            &json!({"keep.example.com/x": "y"})
        );
    }
}
