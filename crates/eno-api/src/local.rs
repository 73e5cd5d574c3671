use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use eno_domain::{
    Composition, Gvk, NamespacedName, ResourceRef, ResourceSlice, ResourceSliceStatus,
    FIELD_MANAGER,
};
use eno_merge::{apply_merge_patch, apply_strategic_patch, StaticMergeKeys};

use crate::downstream::{DownstreamApi, ObjectMeta, PatchType};
use crate::error::ApiError;
use crate::upstream::{SliceMeta, UpstreamApi};

// ── LocalDownstream ───────────────────────────────────────────────────────────

/// A strategic kind registered with the fake server: advertised in the
/// generated OpenAPI document and merged per element on the listed paths.
#[derive(Debug, Clone)]
pub struct StrategicKind {
    pub gvk: Gvk,
    pub merge_keys: Vec<(String, String)>,
}

type ObjectKey = (String, String, String, String);

#[derive(Default)]
struct DownstreamInner {
    objects: HashMap<ObjectKey, Value>,
    next_rv: u64,
    /// `None` means every namespace exists.
    namespaces: Option<HashSet<String>>,
    injected_errors: VecDeque<ApiError>,
}

/// In-memory downstream API server.
///
/// Stores objects, bumps resourceVersions, applies merge/strategic/JSON
/// patches, keeps a simplified `managedFields` ledger for server-side
/// apply, and serves a generated OpenAPI document for its strategic kinds.
/// No I/O. Suitable for engine tests.
pub struct LocalDownstream {
    inner: Mutex<DownstreamInner>,
    merge_keys: StaticMergeKeys,
    openapi: Value,
}

impl Default for LocalDownstream {
    fn default() -> Self {
        Self::new(builtin_kinds())
    }
}

fn builtin_kinds() -> Vec<StrategicKind> {
    vec![
        StrategicKind {
            gvk: Gvk::new("", "v1", "ConfigMap"),
            merge_keys: vec![],
        },
        StrategicKind {
            gvk: Gvk::new("", "v1", "Service"),
            merge_keys: vec![("spec.ports".into(), "port".into())],
        },
        StrategicKind {
            gvk: Gvk::new("apps", "v1", "Deployment"),
            merge_keys: vec![
                ("spec.template.spec.containers".into(), "name".into()),
                ("spec.template.spec.initContainers".into(), "name".into()),
                ("spec.template.spec.volumes".into(), "name".into()),
            ],
        },
    ]
}

impl LocalDownstream {
    pub fn new(kinds: Vec<StrategicKind>) -> Self {
        let mut key_entries = Vec::new();
        for kind in &kinds {
            for (path, key) in &kind.merge_keys {
                key_entries.push((path.as_str(), key.as_str()));
            }
        }
        let merge_keys = StaticMergeKeys::new(&key_entries);
        let openapi = build_openapi(&kinds);
        LocalDownstream {
            inner: Mutex::new(DownstreamInner {
                next_rv: 1,
                ..Default::default()
            }),
            merge_keys,
            openapi,
        }
    }

    fn key(target: &ResourceRef) -> ObjectKey {
        (
            target.group.clone(),
            target.kind.clone(),
            target.namespace.clone(),
            target.name.clone(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DownstreamInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Restrict which namespaces exist; writes elsewhere fail like the real
    /// server does.
    pub fn set_namespaces(&self, namespaces: &[&str]) {
        self.lock().namespaces = Some(namespaces.iter().map(|s| s.to_string()).collect());
    }

    /// Queue an error to be returned by the next mutating call.
    pub fn inject_error(&self, error: ApiError) {
        self.lock().injected_errors.push_back(error);
    }

    /// Direct read for test assertions.
    pub fn stored(&self, target: &ResourceRef) -> Option<Value> {
        self.lock().objects.get(&Self::key(target)).cloned()
    }

    /// Simulate another client writing the object: merge `obj` in and
    /// record `manager` in managedFields with the given operation.
    pub fn write_as(&self, manager: &str, operation: &str, gvk: &Gvk, obj: Value) {
        let target = ref_of(&obj, gvk);
        let fields = derive_field_set(&obj, &self.merge_keys, &mut Vec::new());
        let mut inner = self.lock();
        let rv = inner.bump_rv();
        let entry = inner
            .objects
            .entry(Self::key(&target))
            .or_insert_with(|| json!({}));
        apply_strategic_patch(entry, &obj, &self.merge_keys);
        set_resource_version(entry, rv);
        upsert_manager_entry(entry, manager, operation, &fields);
    }

    fn check_namespace(
        inner: &DownstreamInner,
        namespace: &str,
    ) -> Result<(), ApiError> {
        if namespace.is_empty() {
            return Ok(());
        }
        match &inner.namespaces {
            Some(set) if !set.contains(namespace) => {
                Err(ApiError::NamespaceMissing(namespace.to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl DownstreamInner {
    fn bump_rv(&mut self) -> u64 {
        let rv = self.next_rv;
        self.next_rv += 1;
        rv
    }

    fn take_injected(&mut self) -> Option<ApiError> {
        self.injected_errors.pop_front()
    }
}

#[async_trait]
impl DownstreamApi for LocalDownstream {
    async fn get(&self, _gvk: &Gvk, target: &ResourceRef) -> Result<Option<Value>, ApiError> {
        Ok(self.lock().objects.get(&Self::key(target)).cloned())
    }

    async fn get_metadata(
        &self,
        _gvk: &Gvk,
        target: &ResourceRef,
    ) -> Result<Option<ObjectMeta>, ApiError> {
        Ok(self
            .lock()
            .objects
            .get(&Self::key(target))
            .map(ObjectMeta::from_object))
    }

    async fn create(&self, gvk: &Gvk, obj: &Value) -> Result<Value, ApiError> {
        let target = ref_of(obj, gvk);
        let fields = derive_field_set(obj, &self.merge_keys, &mut Vec::new());
        let mut inner = self.lock();
        if let Some(e) = inner.take_injected() {
            return Err(e);
        }
        Self::check_namespace(&inner, &target.namespace)?;
        if inner.objects.contains_key(&Self::key(&target)) {
            return Err(ApiError::Conflict(format!("{} already exists", target)));
        }
        let mut stored = obj.clone();
        let rv = inner.bump_rv();
        set_resource_version(&mut stored, rv);
        upsert_manager_entry(&mut stored, FIELD_MANAGER, "Update", &fields);
        inner.objects.insert(Self::key(&target), stored.clone());
        Ok(stored)
    }

    async fn apply(
        &self,
        _gvk: &Gvk,
        target: &ResourceRef,
        obj: &Value,
        force: bool,
    ) -> Result<Value, ApiError> {
        let fields = derive_field_set(obj, &self.merge_keys, &mut Vec::new());
        let mut inner = self.lock();
        if let Some(e) = inner.take_injected() {
            return Err(e);
        }
        Self::check_namespace(&inner, &target.namespace)?;
        let rv = inner.bump_rv();
        let entry = inner
            .objects
            .entry(Self::key(target))
            .or_insert_with(|| json!({}));
        apply_strategic_patch(entry, obj, &self.merge_keys);
        set_resource_version(entry, rv);
        upsert_manager_entry(entry, FIELD_MANAGER, "Apply", &fields);
        if force {
            strip_overlap_from_others(entry, FIELD_MANAGER, &fields);
        }
        Ok(entry.clone())
    }

    async fn patch(
        &self,
        _gvk: &Gvk,
        target: &ResourceRef,
        patch_type: PatchType,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let mut inner = self.lock();
        if let Some(e) = inner.take_injected() {
            return Err(e);
        }
        let rv = inner.bump_rv();
        let stored = inner
            .objects
            .get_mut(&Self::key(target))
            .ok_or(ApiError::NotFound)?;

        // Optimistic concurrency: a stale resourceVersion in the patch body
        // conflicts, exactly like the real server.
        if let Some(expected) = body
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            let actual = stored
                .pointer("/metadata/resourceVersion")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if expected != actual {
                return Err(ApiError::Conflict(format!(
                    "resourceVersion {} does not match {}",
                    expected, actual
                )));
            }
        }

        match patch_type {
            PatchType::StrategicMerge => apply_strategic_patch(stored, body, &self.merge_keys),
            PatchType::Merge => apply_merge_patch(stored, body),
            PatchType::Json => {
                let ops: json_patch::Patch = serde_json::from_value(body.clone())
                    .map_err(|e| ApiError::Terminal(format!("invalid json patch: {}", e)))?;
                json_patch::patch(stored, &ops)
                    .map_err(|e| ApiError::Terminal(format!("json patch failed: {}", e)))?;
            }
        }
        set_resource_version(stored, rv);
        Ok(stored.clone())
    }

    async fn replace(
        &self,
        _gvk: &Gvk,
        target: &ResourceRef,
        obj: &Value,
    ) -> Result<Value, ApiError> {
        let mut inner = self.lock();
        if let Some(e) = inner.take_injected() {
            return Err(e);
        }
        let rv = inner.bump_rv();
        let stored = inner
            .objects
            .get_mut(&Self::key(target))
            .ok_or(ApiError::NotFound)?;
        let mut replacement = obj.clone();
        set_resource_version(&mut replacement, rv);
        *stored = replacement.clone();
        Ok(replacement)
    }

    async fn delete(&self, _gvk: &Gvk, target: &ResourceRef) -> Result<(), ApiError> {
        let mut inner = self.lock();
        if let Some(e) = inner.take_injected() {
            return Err(e);
        }
        inner.objects.remove(&Self::key(target));
        Ok(())
    }

    async fn update_managed_fields(
        &self,
        _gvk: &Gvk,
        target: &ResourceRef,
        managed_fields: &Value,
    ) -> Result<(), ApiError> {
        let mut inner = self.lock();
        let rv = inner.bump_rv();
        let stored = inner
            .objects
            .get_mut(&Self::key(target))
            .ok_or(ApiError::NotFound)?;
        stored["metadata"]["managedFields"] = managed_fields.clone();
        set_resource_version(stored, rv);
        Ok(())
    }

    async fn fetch_openapi(&self) -> Result<Value, ApiError> {
        Ok(self.openapi.clone())
    }
}

fn ref_of(obj: &Value, gvk: &Gvk) -> ResourceRef {
    ResourceRef {
        group: gvk.group.clone(),
        kind: gvk.kind.clone(),
        name: obj
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        namespace: obj
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn set_resource_version(obj: &mut Value, rv: u64) {
    if !obj.is_object() {
        *obj = json!({});
    }
    if obj.get("metadata").map_or(true, |m| !m.is_object()) {
        obj["metadata"] = json!({});
    }
    obj["metadata"]["resourceVersion"] = json!(rv.to_string());
}

// ── managedFields bookkeeping ─────────────────────────────────────────────────

/// Derive a `fieldsV1` trie for the fields `obj` sets. Keyed lists expand
/// into `k:{…}` members; atomic lists and scalars own their field node.
fn derive_field_set(
    obj: &Value,
    merge_keys: &StaticMergeKeys,
    path: &mut Vec<String>,
) -> Value {
    use eno_merge::MergeMetadata;

    let mut out = Map::new();
    let map = match obj.as_object() {
        Some(m) => m,
        None => return Value::Object(out),
    };
    for (key, child) in map {
        if path.is_empty() && (key == "apiVersion" || key == "kind") {
            continue;
        }
        match child {
            Value::Object(_) => {
                path.push(key.clone());
                out.insert(
                    format!("f:{}", key),
                    derive_field_set(child, merge_keys, path),
                );
                path.pop();
            }
            Value::Array(items) => {
                path.push(key.clone());
                let path_refs: Vec<&str> = path.iter().map(String::as_str).collect();
                match merge_keys.list_merge_key(&path_refs) {
                    Some(mk) => {
                        let mut list_node = Map::new();
                        for item in items {
                            if let Some(kv) = item.get(&mk) {
                                let mut key_obj = Map::new();
                                key_obj.insert(mk.clone(), kv.clone());
                                let trie_key = format!("k:{}", Value::Object(key_obj));
                                let mut member =
                                    derive_field_set(item, merge_keys, path);
                                if let Some(m) = member.as_object_mut() {
                                    m.insert(".".into(), json!({}));
                                }
                                list_node.insert(trie_key, member);
                            }
                        }
                        out.insert(format!("f:{}", key), Value::Object(list_node));
                    }
                    None => {
                        out.insert(format!("f:{}", key), json!({}));
                    }
                }
                path.pop();
            }
            _ => {
                out.insert(format!("f:{}", key), json!({}));
            }
        }
    }
    Value::Object(out)
}

fn upsert_manager_entry(obj: &mut Value, manager: &str, operation: &str, fields: &Value) {
    let managed = obj["metadata"]["managedFields"].take();
    let mut entries = managed.as_array().cloned().unwrap_or_default();
    match entries.iter_mut().find(|e| {
        e.get("manager").and_then(Value::as_str) == Some(manager)
            && e.get("operation").and_then(Value::as_str) == Some(operation)
    }) {
        Some(entry) => {
            let mut merged = entry["fieldsV1"].take();
            union_field_sets(&mut merged, fields);
            entry["fieldsV1"] = merged;
        }
        None => entries.push(json!({
            "manager": manager,
            "operation": operation,
            "fieldsV1": fields,
        })),
    }
    obj["metadata"]["managedFields"] = Value::Array(entries);
}

fn union_field_sets(into: &mut Value, from: &Value) {
    let from_map = match from.as_object() {
        Some(m) => m,
        None => return,
    };
    if !into.is_object() {
        *into = json!({});
    }
    let into_map = match into.as_object_mut() {
        Some(m) => m,
        None => return,
    };
    for (key, child) in from_map {
        match into_map.get_mut(key) {
            Some(slot) => union_field_sets(slot, child),
            None => {
                into_map.insert(key.clone(), child.clone());
            }
        }
    }
}

/// Forced apply: remove the newly-applied fields from every *other* Apply
/// manager's set. Update managers keep their entries — the server cannot
/// take fields from them, which is what the migration path works around.
fn strip_overlap_from_others(obj: &mut Value, manager: &str, fields: &Value) {
    let managed = obj["metadata"]["managedFields"].take();
    let mut entries = managed.as_array().cloned().unwrap_or_default();
    entries.retain_mut(|entry| {
        let is_other_apply = entry.get("manager").and_then(Value::as_str) != Some(manager)
            && entry.get("operation").and_then(Value::as_str) == Some("Apply");
        if !is_other_apply {
            return true;
        }
        if let Some(set) = entry.get_mut("fieldsV1") {
            remove_overlap(set, fields);
            return set.as_object().map_or(true, |m| !m.is_empty());
        }
        true
    });
    obj["metadata"]["managedFields"] = Value::Array(entries);
}

fn remove_overlap(set: &mut Value, taken: &Value) {
    let taken_map = match taken.as_object() {
        Some(m) => m,
        None => return,
    };
    let set_map = match set.as_object_mut() {
        Some(m) => m,
        None => return,
    };
    for (key, sub) in taken_map {
        let leaf = sub.as_object().map_or(true, |m| m.is_empty());
        if leaf {
            set_map.remove(key);
        } else if let Some(slot) = set_map.get_mut(key) {
            remove_overlap(slot, sub);
            if slot.as_object().map_or(false, |m| m.is_empty()) {
                set_map.remove(key);
            }
        }
    }
}

// ── Generated OpenAPI document ────────────────────────────────────────────────

fn build_openapi(kinds: &[StrategicKind]) -> Value {
    let mut paths = Map::new();
    let mut definitions = Map::new();

    for kind in kinds {
        let gvk = &kind.gvk;
        let plural = crate::downstream::plural(&gvk.kind);
        let url = if gvk.group.is_empty() {
            format!("/api/{}/namespaces/{{namespace}}/{}/{{name}}", gvk.version, plural)
        } else {
            format!(
                "/apis/{}/{}/namespaces/{{namespace}}/{}/{{name}}",
                gvk.group, gvk.version, plural
            )
        };
        paths.insert(
            url,
            json!({
                "patch": {
                    "consumes": [
                        "application/json-patch+json",
                        "application/merge-patch+json",
                        "application/strategic-merge-patch+json",
                        "application/apply-patch+yaml",
                    ],
                    "x-kubernetes-group-version-kind": {
                        "group": gvk.group, "version": gvk.version, "kind": gvk.kind,
                    },
                },
            }),
        );

        let mut definition = json!({
            "properties": {},
            "x-kubernetes-group-version-kind": [
                {"group": gvk.group, "version": gvk.version, "kind": gvk.kind},
            ],
        });
        for (path, key) in &kind.merge_keys {
            insert_merge_key(&mut definition, path, key);
        }
        let group = if gvk.group.is_empty() {
            "core".to_string()
        } else {
            gvk.group.clone()
        };
        definitions.insert(
            format!("local.{}.{}.{}", group, gvk.version, gvk.kind),
            definition,
        );
    }

    json!({
        "swagger": "2.0",
        "paths": paths,
        "definitions": definitions,
    })
}

/// Grow `properties` chains in a definition so that the node at `path`
/// carries the merge-key extension.
fn insert_merge_key(definition: &mut Value, path: &str, key: &str) {
    let mut node = definition;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let props = &mut node["properties"];
        if !props.is_object() {
            *props = json!({});
        }
        if !props[*segment].is_object() {
            props[*segment] = json!({});
        }
        node = &mut node["properties"][*segment];
        if i == segments.len() - 1 {
            node["type"] = json!("array");
            node["x-kubernetes-patch-merge-key"] = json!(key);
        }
    }
}

// ── InMemoryUpstream ──────────────────────────────────────────────────────────

#[derive(Default)]
struct UpstreamInner {
    compositions: HashMap<NamespacedName, Composition>,
    slices: HashMap<NamespacedName, (ResourceSlice, u64)>,
    status_updates: u64,
}

/// In-memory upstream API server holding Compositions and ResourceSlices.
#[derive(Default)]
pub struct InMemoryUpstream {
    inner: Mutex<UpstreamInner>,
}

impl InMemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UpstreamInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn put_composition(&self, composition: Composition) {
        self.lock()
            .compositions
            .insert(composition.namespaced_name(), composition);
    }

    pub fn remove_composition(&self, name: &NamespacedName) {
        self.lock().compositions.remove(name);
    }

    pub fn put_slice(&self, slice: ResourceSlice) {
        let name = slice.metadata.namespaced_name();
        let mut inner = self.lock();
        let rv = inner.slices.get(&name).map(|(_, rv)| rv + 1).unwrap_or(1);
        inner.slices.insert(name, (slice, rv));
    }

    pub fn slice_status(&self, name: &NamespacedName) -> Option<ResourceSliceStatus> {
        self.lock().slices.get(name).map(|(s, _)| s.status.clone())
    }

    /// How many status writes have landed, for write-coalescing assertions.
    pub fn status_update_count(&self) -> u64 {
        self.lock().status_updates
    }
}

#[async_trait]
impl UpstreamApi for InMemoryUpstream {
    async fn get_composition(
        &self,
        name: &NamespacedName,
    ) -> Result<Option<Composition>, ApiError> {
        Ok(self.lock().compositions.get(name).cloned())
    }

    async fn list_compositions(&self) -> Result<Vec<Composition>, ApiError> {
        Ok(self.lock().compositions.values().cloned().collect())
    }

    async fn get_slice_meta(&self, name: &NamespacedName) -> Result<Option<SliceMeta>, ApiError> {
        Ok(self.lock().slices.get(name).map(|(slice, rv)| {
            let mut metadata = slice.metadata.clone();
            metadata.resource_version = Some(rv.to_string());
            SliceMeta {
                metadata,
                status: slice.status.clone(),
            }
        }))
    }

    async fn get_slice(&self, name: &NamespacedName) -> Result<Option<ResourceSlice>, ApiError> {
        Ok(self.lock().slices.get(name).map(|(slice, rv)| {
            let mut slice = slice.clone();
            slice.metadata.resource_version = Some(rv.to_string());
            slice
        }))
    }

    async fn update_slice_status(
        &self,
        name: &NamespacedName,
        resource_version: &str,
        status: &ResourceSliceStatus,
    ) -> Result<(), ApiError> {
        let mut inner = self.lock();
        let (slice, rv) = inner.slices.get_mut(name).ok_or(ApiError::NotFound)?;
        if resource_version != rv.to_string() {
            return Err(ApiError::Conflict(format!(
                "resourceVersion {} does not match {}",
                resource_version, rv
            )));
        }
        slice.status = status.clone();
        *rv += 1;
        inner.status_updates += 1;
        Ok(())
    }
}
