use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use eno_expr::{PathExpr, Program};

use crate::annotations;
use crate::error::DomainError;
use crate::readiness::ReadinessCheck;
use crate::types::{Gvk, ManifestRef, NamespacedName, ResourceRef};
use crate::upstream::Manifest;

/// The `apiVersion` identifying pseudo-resources interpreted by the engine
/// itself rather than applied verbatim.
pub const PATCH_API_VERSION: &str = "eno.azure.io/v1";
pub const PATCH_KIND: &str = "Patch";

// ── Overrides ─────────────────────────────────────────────────────────────────

/// A conditional mutation of the desired manifest, re-evaluated on every
/// reconcile against the live downstream object.
#[derive(Debug, Clone)]
pub struct Override {
    pub path: PathExpr,
    pub value: Option<Value>,
    pub condition: Option<Program>,
}

#[derive(Debug, Deserialize)]
struct RawOverride {
    path: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    condition: Option<String>,
}

// ── Patch pseudo-resource ─────────────────────────────────────────────────────

/// A JSON-patch-like operation list applied to a referenced downstream
/// object. Patches never create their target.
#[derive(Debug, Clone)]
pub struct ResourcePatch {
    /// GVK of the object the ops apply to.
    pub target_gvk: Gvk,
    /// Raw RFC 6902 ops, deserialized by the reconciler at apply time.
    pub ops: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPatchSpec {
    api_version: String,
    kind: String,
    ops: Value,
}

impl ResourcePatch {
    /// Whether applying these ops would set `metadata.deletionTimestamp`,
    /// which the engine interprets as "delete the target".
    pub fn deletes_target(&self) -> bool {
        self.ops.as_array().map_or(false, |ops| {
            ops.iter().any(|op| {
                op.get("path").and_then(Value::as_str) == Some("/metadata/deletionTimestamp")
                    && !matches!(op.get("value"), None | Some(Value::Null))
            })
        })
    }
}

// ── Resource ──────────────────────────────────────────────────────────────────

/// One desired resource reconstituted from a slice manifest. Immutable once
/// inserted into the cache for a given synthesis UUID — the only
/// post-construction mutation is the observed-resource-version hint.
#[derive(Debug)]
pub struct Resource {
    pub manifest_ref: ManifestRef,
    pub gvk: Gvk,
    pub resource_ref: ResourceRef,
    /// Parsed manifest with all engine annotations stripped.
    pub parsed: Value,
    /// Marked for deletion by the synthesizer.
    pub deleted: bool,

    pub readiness_group: i64,
    pub deletion_group: Option<i64>,
    pub reconcile_interval: Option<Duration>,
    pub disable_reconciliation: bool,
    pub replace: bool,
    pub fail_open: Option<bool>,

    pub readiness_checks: Vec<ReadinessCheck>,
    pub overrides: Vec<Override>,
    pub patch: Option<ResourcePatch>,

    /// Last resourceVersion observed downstream; powers the metadata-only
    /// fast path. Never part of the resource's identity.
    observed_version: Mutex<Option<String>>,
}

impl Resource {
    pub fn from_manifest(
        slice: NamespacedName,
        index: usize,
        manifest: &Manifest,
    ) -> Result<Self, DomainError> {
        let invalid = |message: String| DomainError::InvalidManifest {
            slice: slice.to_string(),
            index,
            message,
        };

        let mut parsed: Value = serde_json::from_str(&manifest.manifest)
            .map_err(|e| invalid(format!("not valid JSON: {}", e)))?;
        if !parsed.is_object() {
            return Err(invalid("manifest is not a JSON object".into()));
        }

        let api_version = parsed
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing apiVersion".into()))?
            .to_string();
        let kind = parsed
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing kind".into()))?
            .to_string();
        let gvk = Gvk::from_api_version(&api_version, &kind);

        let name = parsed
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing metadata.name".into()))?
            .to_string();
        let namespace = parsed
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        // Pseudo-resource: the ops target another object entirely.
        let patch = if api_version == PATCH_API_VERSION && kind == PATCH_KIND {
            let spec = parsed
                .get("patch")
                .cloned()
                .ok_or_else(|| invalid("Patch resource is missing .patch".into()))?;
            let raw: RawPatchSpec = serde_json::from_value(spec)
                .map_err(|e| invalid(format!("invalid .patch: {}", e)))?;
            Some(ResourcePatch {
                target_gvk: Gvk::from_api_version(&raw.api_version, &raw.kind),
                ops: raw.ops,
            })
        } else {
            None
        };

        let resource_ref = match &patch {
            Some(p) => ResourceRef {
                group: p.target_gvk.group.clone(),
                kind: p.target_gvk.kind.clone(),
                name: name.clone(),
                namespace: namespace.clone(),
            },
            None => ResourceRef {
                group: gvk.group.clone(),
                kind: kind.clone(),
                name: name.clone(),
                namespace: namespace.clone(),
            },
        };

        // Annotation parsing, then stripping.
        let mut readiness_group = 0i64;
        let mut deletion_group = None;
        let mut reconcile_interval = None;
        let mut disable_reconciliation = false;
        let mut replace = false;
        let mut fail_open = None;
        let mut readiness_checks = Vec::new();
        let mut overrides = Vec::new();

        let anns: Vec<(String, String)> = parsed
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        for (key, value) in &anns {
            if let Some(check_name) = annotations::readiness_check_name(key) {
                let check = ReadinessCheck::new(check_name, value).map_err(|e| {
                    DomainError::Expr {
                        key: key.clone(),
                        source: e,
                    }
                })?;
                readiness_checks.push(check);
                continue;
            }
            match key.as_str() {
                annotations::READINESS_GROUP => {
                    readiness_group = value.parse().map_err(|_| {
                        DomainError::InvalidAnnotation {
                            key: key.clone(),
                            message: format!("not an integer: {:?}", value),
                        }
                    })?;
                }
                annotations::DELETION_GROUP => {
                    deletion_group = Some(value.parse().map_err(|_| {
                        DomainError::InvalidAnnotation {
                            key: key.clone(),
                            message: format!("not an integer: {:?}", value),
                        }
                    })?);
                }
                annotations::RECONCILE_INTERVAL => {
                    reconcile_interval = Some(annotations::parse_duration(value)?);
                }
                annotations::DISABLE_RECONCILIATION => {
                    disable_reconciliation = value == "true";
                }
                annotations::REPLACE => {
                    replace = value == "true";
                }
                annotations::FAIL_OPEN => {
                    fail_open = Some(value == "true");
                }
                annotations::OVERRIDES => {
                    let raw: Vec<RawOverride> = serde_json::from_str(value).map_err(|e| {
                        DomainError::InvalidAnnotation {
                            key: key.clone(),
                            message: format!("not a valid op list: {}", e),
                        }
                    })?;
                    for op in raw {
                        overrides.push(Override {
                            path: PathExpr::parse(&op.path).map_err(|e| DomainError::Expr {
                                key: key.clone(),
                                source: e,
                            })?,
                            value: op.value.filter(|v| !v.is_null()),
                            condition: op
                                .condition
                                .as_deref()
                                .map(Program::compile)
                                .transpose()
                                .map_err(|e| DomainError::Expr {
                                    key: key.clone(),
                                    source: e,
                                })?,
                        });
                    }
                }
                _ => {}
            }
        }

        // Named checks evaluate in a stable order regardless of map iteration.
        readiness_checks.sort_by(|a, b| a.name.cmp(&b.name));

        strip_eno_annotations(&mut parsed);

        Ok(Resource {
            manifest_ref: ManifestRef { slice, index },
            gvk,
            resource_ref,
            parsed,
            deleted: manifest.deleted,
            readiness_group,
            deletion_group,
            reconcile_interval,
            disable_reconciliation,
            replace,
            fail_open,
            readiness_checks,
            overrides,
            patch,
            observed_version: Mutex::new(None),
        })
    }

    /// Deletion ordering key; resources without an explicit group sort at 0.
    pub fn deletion_group_or_default(&self) -> i64 {
        self.deletion_group.unwrap_or(0)
    }

    pub fn is_patch(&self) -> bool {
        self.patch.is_some()
    }

    /// Effective fail-open setting given the composition default.
    pub fn fail_open(&self, composition_default: bool) -> bool {
        self.fail_open.unwrap_or(composition_default)
    }

    pub fn observed_version(&self) -> Option<String> {
        self.observed_version.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_observed_version(&self, version: Option<String>) {
        if let Ok(mut guard) = self.observed_version.lock() {
            *guard = version;
        }
    }
}

/// Drop every `eno.azure.io/*` annotation; remove the annotations map
/// entirely once emptied.
fn strip_eno_annotations(manifest: &mut Value) {
    let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) else {
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(doc: Value) -> Manifest {
        Manifest {
            manifest: doc.to_string(),
            deleted: false,
        }
    }

    fn build(doc: Value) -> Resource {
        Resource::from_manifest(NamespacedName::new("default", "slice-0"), 0, &manifest(doc))
            .unwrap()
    }

    #[test]
    fn parses_a_plain_configmap() {
        let res = build(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "apps"},
            "data": {"foo": "bar"},
        }));
        assert_eq!(res.gvk, Gvk::new("", "v1", "ConfigMap"));
        assert_eq!(res.resource_ref.name, "cm");
        assert_eq!(res.resource_ref.namespace, "apps");
        assert_eq!(res.readiness_group, 0);
        assert!(res.deletion_group.is_none());
        assert!(!res.is_patch());
        assert!(res.readiness_checks.is_empty());
    }

    #[test]
    fn parses_annotations_and_strips_them() {
        let res = build(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "annotations": {
                "eno.azure.io/readiness": "self.data.foo == 'baz'",
                "eno.azure.io/readiness-extra": "has(self.data.bar)",
                "eno.azure.io/readiness-group": "2",
                "eno.azure.io/deletion-group": "-1",
                "eno.azure.io/reconcile-interval": "100ms",
                "eno.azure.io/replace": "true",
                "eno.azure.io/fail-open": "false",
                "keep.example.com/this": "yes",
            }},
            "data": {"foo": "bar"},
        }));
        assert_eq!(res.readiness_group, 2);
        assert_eq!(res.deletion_group, Some(-1));
        assert_eq!(res.reconcile_interval, Some(Duration::from_millis(100)));
        assert!(res.replace);
        assert_eq!(res.fail_open, Some(false));
        assert!(res.fail_open(true) == false);
        assert_eq!(res.readiness_checks.len(), 2);
        // Sorted by name: "" then "extra".
        assert_eq!(res.readiness_checks[0].name, "");
        assert_eq!(res.readiness_checks[1].name, "extra");

        let anns = res.parsed.pointer("/metadata/annotations").unwrap();
        assert_eq!(anns, &json!({"keep.example.com/this": "yes"}));
    }

    #[test]
    fn annotations_map_is_removed_when_emptied() {
        let res = build(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "annotations": {
                "eno.azure.io/replace": "true",
            }},
        }));
        assert!(res.parsed.pointer("/metadata/annotations").is_none());
    }

    #[test]
    fn parses_overrides() {
        let ops = json!([
            {"path": "self.data.foo", "value": "eno-value", "condition": "!has(self.data.foo)"},
            {"path": "self.data.gone", "value": null},
        ])
        .to_string();
        let res = build(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "annotations": {"eno.azure.io/overrides": ops}},
            "data": {},
        }));
        assert_eq!(res.overrides.len(), 2);
        assert!(res.overrides[0].condition.is_some());
        assert_eq!(res.overrides[0].value, Some(json!("eno-value")));
        // null value means delete.
        assert!(res.overrides[1].value.is_none());
    }

    #[test]
    fn parses_patch_pseudo_resource() {
        let res = build(json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "Patch",
            "metadata": {"name": "target-cm", "namespace": "apps"},
            "patch": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "ops": [
                    {"op": "add", "path": "/data/injected", "value": "x"},
                ],
            },
        }));
        let patch = res.patch.as_ref().unwrap();
        assert_eq!(patch.target_gvk, Gvk::new("", "v1", "ConfigMap"));
        assert!(!patch.deletes_target());
        // The downstream identity is the *target's* kind, not Patch.
        assert_eq!(res.resource_ref.kind, "ConfigMap");
        assert_eq!(res.resource_ref.name, "target-cm");
    }

    #[test]
    fn patch_deletion_op_is_detected() {
        let res = build(json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "Patch",
            "metadata": {"name": "doomed"},
            "patch": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "ops": [
                    {"op": "add", "path": "/metadata/deletionTimestamp", "value": "anything"},
                ],
            },
        }));
        assert!(res.patch.as_ref().unwrap().deletes_target());

        let res = build(json!({
            "apiVersion": "eno.azure.io/v1",
            "kind": "Patch",
            "metadata": {"name": "spared"},
            "patch": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "ops": [
                    {"op": "add", "path": "/metadata/deletionTimestamp", "value": null},
                ],
            },
        }));
        assert!(!res.patch.as_ref().unwrap().deletes_target());
    }

    #[test]
    fn malformed_manifests_are_terminal_errors_not_panics() {
        let slice = NamespacedName::new("default", "slice-0");
        for bad in [
            json!("not-an-object").to_string(),
            "not json at all".to_string(),
            json!({"kind": "ConfigMap"}).to_string(),
            json!({"apiVersion": "v1"}).to_string(),
            json!({"apiVersion": "v1", "kind": "ConfigMap"}).to_string(),
        ] {
            let m = Manifest {
                manifest: bad,
                deleted: false,
            };
            assert!(Resource::from_manifest(slice.clone(), 0, &m).is_err());
        }
    }

    #[test]
    fn invalid_annotation_values_error() {
        let slice = NamespacedName::new("default", "slice-0");
        let m = manifest(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "annotations": {
                "eno.azure.io/readiness-group": "not-a-number",
            }},
        }));
        assert!(matches!(
            Resource::from_manifest(slice, 0, &m),
            Err(DomainError::InvalidAnnotation { .. })
        ));
    }

    #[test]
    fn observed_version_hint_is_interior_mutable() {
        let res = build(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
        }));
        assert!(res.observed_version().is_none());
        res.set_observed_version(Some("42".into()));
        assert_eq!(res.observed_version().as_deref(), Some("42"));
    }
}
