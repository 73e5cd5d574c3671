use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use eno_domain::Gvk;
use eno_merge::MergeMetadata;

use crate::downstream::DownstreamApi;
use crate::error::ApiError;
use crate::pacer::Pacer;

const STRATEGIC_MEDIA_TYPE: &str = "application/strategic-merge-patch+json";
const MERGE_KEY_EXTENSION: &str = "x-kubernetes-patch-merge-key";
const GVK_EXTENSION: &str = "x-kubernetes-group-version-kind";

// ── Schema view ───────────────────────────────────────────────────────────────

/// One GVK's view into the server's OpenAPI v2 document. Existence implies
/// the kind supports strategic merge; the view also answers list-merge-key
/// lookups for the three-way merge.
#[derive(Debug, Clone)]
pub struct OpenApiSchema {
    doc: Arc<Value>,
    root: String,
}

impl OpenApiSchema {
    fn definitions(&self) -> Option<&Value> {
        self.doc.get("definitions")
    }

    fn deref<'a>(&'a self, node: &'a Value) -> Option<&'a Value> {
        match node.get("$ref").and_then(Value::as_str) {
            Some(r) => {
                let name = r.strip_prefix("#/definitions/")?;
                self.definitions()?.get(name)
            }
            None => Some(node),
        }
    }

    fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut node = self.definitions()?.get(&self.root)?;
        for (i, field) in path.iter().enumerate() {
            node = self.deref(node)?;
            node = node.get("properties")?.get(*field)?;
            // Intermediate list fields: step through their element schema.
            if i + 1 < path.len() {
                if let Some(items) = node.get("items") {
                    node = items;
                }
            }
        }
        Some(node)
    }
}

impl MergeMetadata for OpenApiSchema {
    fn list_merge_key(&self, path: &[&str]) -> Option<String> {
        self.lookup(path)?
            .get(MERGE_KEY_EXTENSION)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// What a PATCH against a GVK should look like.
#[derive(Debug, Clone)]
pub enum PatchStrategy {
    /// The kind has a strategic-merge schema.
    StrategicMerge(Arc<OpenApiSchema>),
    /// No schema (CRDs, unknown kinds): RFC 7386 fallback.
    JsonMerge,
}

// ── Discovery cache ───────────────────────────────────────────────────────────

struct State {
    doc: Option<Arc<Value>>,
    by_gvk: HashMap<Gvk, Option<Arc<OpenApiSchema>>>,
}

/// Lazy GVK → patch-strategy resolution over `/openapi/v2`. Fills are
/// serialized and paced; a per-reconcile lookup miss optionally clears and
/// refills once to pick up freshly installed CRDs.
pub struct DiscoveryCache {
    api: Arc<dyn DownstreamApi>,
    pacer: Pacer,
    rediscover_when_not_found: bool,
    state: Mutex<State>,
}

impl DiscoveryCache {
    pub fn new(api: Arc<dyn DownstreamApi>, qps: f64, rediscover_when_not_found: bool) -> Self {
        DiscoveryCache {
            api,
            pacer: Pacer::new(qps, 1),
            rediscover_when_not_found,
            state: Mutex::new(State {
                doc: None,
                by_gvk: HashMap::new(),
            }),
        }
    }

    /// Resolve the patch strategy for a GVK. Never fails on an absent
    /// schema — that is the JSON-merge signal, not an error.
    pub async fn patch_strategy(&self, gvk: &Gvk) -> Result<PatchStrategy, ApiError> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.by_gvk.get(gvk) {
            match cached {
                Some(schema) => return Ok(PatchStrategy::StrategicMerge(schema.clone())),
                None if !self.rediscover_when_not_found => return Ok(PatchStrategy::JsonMerge),
                None => {}
            }
        }

        // First try against the document already on hand.
        if state.doc.is_none() {
            self.refill(&mut state).await?;
        }
        let mut schema = state.doc.as_ref().and_then(|doc| resolve_gvk(doc, gvk));

        // One clear-and-refill per lookup before giving up.
        if schema.is_none() && self.rediscover_when_not_found {
            debug!(%gvk, "schema miss, refilling discovery cache");
            self.refill(&mut state).await?;
            schema = state.doc.as_ref().and_then(|doc| resolve_gvk(doc, gvk));
        }

        state.by_gvk.insert(gvk.clone(), schema.clone());
        Ok(match schema {
            Some(s) => PatchStrategy::StrategicMerge(s),
            None => PatchStrategy::JsonMerge,
        })
    }

    async fn refill(&self, state: &mut State) -> Result<(), ApiError> {
        self.pacer.acquire().await;
        let doc = self.api.fetch_openapi().await?;
        state.doc = Some(Arc::new(doc));
        state.by_gvk.clear();
        Ok(())
    }
}

/// A GVK resolves to a schema iff the document both declares strategic
/// merge on its PATCH path and carries a definition for it.
fn resolve_gvk(doc: &Arc<Value>, gvk: &Gvk) -> Option<Arc<OpenApiSchema>> {
    if !patch_supports_strategic(doc, gvk) {
        return None;
    }
    let root = find_definition(doc, gvk)?;
    Some(Arc::new(OpenApiSchema {
        doc: doc.clone(),
        root,
    }))
}

fn gvk_matches(ext: &Value, gvk: &Gvk) -> bool {
    ext.get("group").and_then(Value::as_str) == Some(gvk.group.as_str())
        && ext.get("version").and_then(Value::as_str) == Some(gvk.version.as_str())
        && ext.get("kind").and_then(Value::as_str) == Some(gvk.kind.as_str())
}

fn patch_supports_strategic(doc: &Value, gvk: &Gvk) -> bool {
    let paths = match doc.get("paths").and_then(Value::as_object) {
        Some(p) => p,
        None => return false,
    };
    for item in paths.values() {
        let patch = match item.get("patch") {
            Some(p) => p,
            None => continue,
        };
        let matches = patch
            .get(GVK_EXTENSION)
            .map_or(false, |ext| gvk_matches(ext, gvk));
        if !matches {
            continue;
        }
        let consumes_strategic = patch
            .get("consumes")
            .and_then(Value::as_array)
            .map_or(false, |c| {
                c.iter().any(|m| m.as_str() == Some(STRATEGIC_MEDIA_TYPE))
            });
        if consumes_strategic {
            return true;
        }
    }
    false
}

fn find_definition(doc: &Value, gvk: &Gvk) -> Option<String> {
    let definitions = doc.get("definitions")?.as_object()?;
    for (name, def) in definitions {
        let matched = def
            .get(GVK_EXTENSION)
            .and_then(Value::as_array)
            .map_or(false, |list| list.iter().any(|ext| gvk_matches(ext, gvk)));
        if matched {
            return Some(name.clone());
        }
    }
    warn!(%gvk, "strategic patch advertised but no schema definition found");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    use eno_domain::ResourceRef;

    use crate::downstream::{ObjectMeta, PatchType};

    /// Serves a swappable OpenAPI document and counts fetches.
    struct FakeApi {
        doc: std::sync::Mutex<Value>,
        fetches: AtomicU32,
    }

    impl FakeApi {
        fn new(doc: Value) -> Arc<Self> {
            Arc::new(FakeApi {
                doc: std::sync::Mutex::new(doc),
                fetches: AtomicU32::new(0),
            })
        }

        fn set_doc(&self, doc: Value) {
            *self.doc.lock().unwrap() = doc;
        }

        fn fetch_count(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DownstreamApi for FakeApi {
        async fn get(&self, _: &Gvk, _: &ResourceRef) -> Result<Option<Value>, ApiError> {
            unimplemented!("discovery only")
        }
        async fn get_metadata(
            &self,
            _: &Gvk,
            _: &ResourceRef,
        ) -> Result<Option<ObjectMeta>, ApiError> {
            unimplemented!("discovery only")
        }
        async fn create(&self, _: &Gvk, _: &Value) -> Result<Value, ApiError> {
            unimplemented!("discovery only")
        }
        async fn apply(
            &self,
            _: &Gvk,
            _: &ResourceRef,
            _: &Value,
            _: bool,
        ) -> Result<Value, ApiError> {
            unimplemented!("discovery only")
        }
        async fn patch(
            &self,
            _: &Gvk,
            _: &ResourceRef,
            _: PatchType,
            _: &Value,
        ) -> Result<Value, ApiError> {
            unimplemented!("discovery only")
        }
        async fn replace(&self, _: &Gvk, _: &ResourceRef, _: &Value) -> Result<Value, ApiError> {
            unimplemented!("discovery only")
        }
        async fn delete(&self, _: &Gvk, _: &ResourceRef) -> Result<(), ApiError> {
            unimplemented!("discovery only")
        }
        async fn update_managed_fields(
            &self,
            _: &Gvk,
            _: &ResourceRef,
            _: &Value,
        ) -> Result<(), ApiError> {
            unimplemented!("discovery only")
        }
        async fn fetch_openapi(&self) -> Result<Value, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.doc.lock().unwrap().clone())
        }
    }

    fn service_doc() -> Value {
        json!({
            "paths": {
                "/api/v1/namespaces/{namespace}/services/{name}": {
                    "patch": {
                        "consumes": [
                            "application/json-patch+json",
                            "application/merge-patch+json",
                            "application/strategic-merge-patch+json",
                        ],
                        "x-kubernetes-group-version-kind": {
                            "group": "", "version": "v1", "kind": "Service",
                        },
                    },
                },
            },
            "definitions": {
                "io.k8s.api.core.v1.Service": {
                    "properties": {
                        "spec": {"$ref": "#/definitions/io.k8s.api.core.v1.ServiceSpec"},
                    },
                    "x-kubernetes-group-version-kind": [
                        {"group": "", "version": "v1", "kind": "Service"},
                    ],
                },
                "io.k8s.api.core.v1.ServiceSpec": {
                    "properties": {
                        "ports": {
                            "type": "array",
                            "items": {"$ref": "#/definitions/io.k8s.api.core.v1.ServicePort"},
                            "x-kubernetes-patch-merge-key": "port",
                        },
                    },
                },
                "io.k8s.api.core.v1.ServicePort": {
                    "properties": {"port": {"type": "integer"}},
                },
            },
        })
    }

    #[tokio::test]
    async fn resolves_strategic_kinds_with_merge_keys() {
        let api = FakeApi::new(service_doc());
        let cache = DiscoveryCache::new(api.clone(), 100.0, false);

        let gvk = Gvk::new("", "v1", "Service");
        match cache.patch_strategy(&gvk).await.unwrap() {
            PatchStrategy::StrategicMerge(schema) => {
                assert_eq!(
                    schema.list_merge_key(&["spec", "ports"]).as_deref(),
                    Some("port")
                );
                assert!(schema.list_merge_key(&["spec", "selector"]).is_none());
            }
            PatchStrategy::JsonMerge => panic!("expected strategic merge"),
        }
        assert_eq!(api.fetch_count(), 1);

        // Second lookup is served from cache.
        cache.patch_strategy(&gvk).await.unwrap();
        assert_eq!(api.fetch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_kinds_fall_back_to_json_merge() {
        let api = FakeApi::new(service_doc());
        let cache = DiscoveryCache::new(api.clone(), 100.0, false);

        let crd = Gvk::new("example.com", "v1", "Widget");
        assert!(matches!(
            cache.patch_strategy(&crd).await.unwrap(),
            PatchStrategy::JsonMerge
        ));
        // Without rediscovery the miss is cached: no extra fetches.
        cache.patch_strategy(&crd).await.unwrap();
        assert_eq!(api.fetch_count(), 1);
    }

    #[tokio::test]
    async fn rediscovers_once_per_lookup_when_configured() {
        let api = FakeApi::new(service_doc());
        let cache = DiscoveryCache::new(api.clone(), 1000.0, true);

        let crd = Gvk::new("example.com", "v1", "Widget");
        assert!(matches!(
            cache.patch_strategy(&crd).await.unwrap(),
            PatchStrategy::JsonMerge
        ));
        // Initial fill + one refill for the miss.
        assert_eq!(api.fetch_count(), 2);

        // The CRD is installed between reconciles; the next lookup's
        // refill picks it up.
        let mut doc = service_doc();
        doc["paths"]["/apis/example.com/v1/namespaces/{namespace}/widgets/{name}"] = json!({
            "patch": {
                "consumes": ["application/strategic-merge-patch+json"],
                "x-kubernetes-group-version-kind": {
                    "group": "example.com", "version": "v1", "kind": "Widget",
                },
            },
        });
        doc["definitions"]["com.example.v1.Widget"] = json!({
            "properties": {},
            "x-kubernetes-group-version-kind": [
                {"group": "example.com", "version": "v1", "kind": "Widget"},
            ],
        });
        api.set_doc(doc);

        assert!(matches!(
            cache.patch_strategy(&crd).await.unwrap(),
            PatchStrategy::StrategicMerge(_)
        ));
    }

    #[tokio::test]
    async fn strategic_requires_the_media_type() {
        let mut doc = service_doc();
        doc["paths"]["/api/v1/namespaces/{namespace}/services/{name}"]["patch"]["consumes"] =
            json!(["application/merge-patch+json"]);
        let api = FakeApi::new(doc);
        let cache = DiscoveryCache::new(api, 100.0, false);

        assert!(matches!(
            cache.patch_strategy(&Gvk::new("", "v1", "Service")).await.unwrap(),
            PatchStrategy::JsonMerge
        ));
    }
}
