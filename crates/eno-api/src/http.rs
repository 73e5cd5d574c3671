use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use eno_domain::{
    Composition, Gvk, NamespacedName, ResourceRef, ResourceSlice, ResourceSliceStatus,
    API_GROUP, API_VERSION, FIELD_MANAGER,
};

use crate::downstream::{resource_path, DownstreamApi, ObjectMeta, PatchType};
use crate::error::ApiError;
use crate::kubeconfig::RestConfig;
use crate::pacer::Pacer;
use crate::upstream::{SliceMeta, UpstreamApi};

/// Accept header requesting a metadata-only projection of an object.
const PARTIAL_METADATA: &str =
    "application/json;as=PartialObjectMetadata;g=meta.k8s.io;v=v1,application/json";

// ── REST core ─────────────────────────────────────────────────────────────────

/// Shared request plumbing for one API server: base URL, bearer auth, the
/// QPS pacer, and error classification from response bodies.
pub struct RestClient {
    config: RestConfig,
    pacer: Arc<Pacer>,
}

impl RestClient {
    pub fn new(config: RestConfig, pacer: Arc<Pacer>) -> Self {
        RestClient { config, pacer }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url, path);
        let mut req = self.config.client.request(method, url);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        self.pacer.acquire().await;
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if (200..300).contains(&status) {
            return Ok(body);
        }
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(text);
        debug!(status, %message, "api request failed");
        Err(ApiError::from_status(status, message))
    }

    /// GET that maps 404 to `None`.
    async fn get_optional(&self, path: &str, accept: Option<&str>) -> Result<Option<Value>, ApiError> {
        let mut req = self.request(Method::GET, path);
        if let Some(accept) = accept {
            req = req.header(ACCEPT, accept);
        }
        match self.execute(req).await {
            Ok(body) => Ok(Some(body)),
            Err(ApiError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── Downstream over HTTP ──────────────────────────────────────────────────────

pub struct HttpDownstream {
    rest: RestClient,
}

impl HttpDownstream {
    pub fn new(config: RestConfig, pacer: Arc<Pacer>) -> Self {
        HttpDownstream {
            rest: RestClient::new(config, pacer),
        }
    }
}

#[async_trait]
impl DownstreamApi for HttpDownstream {
    async fn get(&self, gvk: &Gvk, target: &ResourceRef) -> Result<Option<Value>, ApiError> {
        let path = resource_path(gvk, &target.namespace, Some(&target.name));
        self.rest.get_optional(&path, None).await
    }

    async fn get_metadata(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
    ) -> Result<Option<ObjectMeta>, ApiError> {
        let path = resource_path(gvk, &target.namespace, Some(&target.name));
        let body = self.rest.get_optional(&path, Some(PARTIAL_METADATA)).await?;
        Ok(body.map(|b| ObjectMeta::from_object(&b)))
    }

    async fn create(&self, gvk: &Gvk, obj: &Value) -> Result<Value, ApiError> {
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("");
        let path = resource_path(gvk, namespace, None);
        let req = self
            .rest
            .request(Method::POST, &path)
            .query(&[("fieldManager", FIELD_MANAGER)])
            .json(obj);
        self.rest.execute(req).await
    }

    async fn apply(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        obj: &Value,
        force: bool,
    ) -> Result<Value, ApiError> {
        let path = resource_path(gvk, &target.namespace, Some(&target.name));
        let req = self
            .rest
            .request(Method::PATCH, &path)
            .header(CONTENT_TYPE, "application/apply-patch+yaml")
            .query(&[
                ("fieldManager", FIELD_MANAGER),
                ("force", if force { "true" } else { "false" }),
            ])
            .json(obj);
        self.rest.execute(req).await
    }

    async fn patch(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        patch_type: PatchType,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let path = resource_path(gvk, &target.namespace, Some(&target.name));
        let req = self
            .rest
            .request(Method::PATCH, &path)
            .header(CONTENT_TYPE, patch_type.content_type())
            .query(&[("fieldManager", FIELD_MANAGER)])
            .json(body);
        self.rest.execute(req).await
    }

    async fn replace(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        obj: &Value,
    ) -> Result<Value, ApiError> {
        let path = resource_path(gvk, &target.namespace, Some(&target.name));
        let req = self
            .rest
            .request(Method::PUT, &path)
            .query(&[("fieldManager", FIELD_MANAGER)])
            .json(obj);
        self.rest.execute(req).await
    }

    async fn delete(&self, gvk: &Gvk, target: &ResourceRef) -> Result<(), ApiError> {
        let path = resource_path(gvk, &target.namespace, Some(&target.name));
        match self.rest.execute(self.rest.request(Method::DELETE, &path)).await {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn update_managed_fields(
        &self,
        gvk: &Gvk,
        target: &ResourceRef,
        managed_fields: &Value,
    ) -> Result<(), ApiError> {
        let body = json!({"metadata": {"managedFields": managed_fields}});
        self.patch(gvk, target, PatchType::Merge, &body).await?;
        Ok(())
    }

    async fn fetch_openapi(&self) -> Result<Value, ApiError> {
        let req = self.rest.request(Method::GET, "/openapi/v2");
        self.rest.execute(req).await
    }
}

// ── Upstream over HTTP ────────────────────────────────────────────────────────

pub struct HttpUpstream {
    rest: RestClient,
}

impl HttpUpstream {
    pub fn new(config: RestConfig, pacer: Arc<Pacer>) -> Self {
        HttpUpstream {
            rest: RestClient::new(config, pacer),
        }
    }

    fn crd_path(plural_name: &str, name: &NamespacedName) -> String {
        format!(
            "/apis/{}/{}/namespaces/{}/{}/{}",
            API_GROUP, API_VERSION, name.namespace, plural_name, name.name
        )
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn get_composition(
        &self,
        name: &NamespacedName,
    ) -> Result<Option<Composition>, ApiError> {
        let body = self
            .rest
            .get_optional(&Self::crd_path("compositions", name), None)
            .await?;
        body.map(|b| {
            serde_json::from_value::<Composition>(b)
                .map_err(|e| ApiError::Terminal(format!("decoding composition: {}", e)))
        })
        .transpose()
    }

    async fn list_compositions(&self) -> Result<Vec<Composition>, ApiError> {
        let path = format!("/apis/{}/{}/compositions", API_GROUP, API_VERSION);
        let body = self.rest.execute(self.rest.request(Method::GET, &path)).await?;
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| ApiError::Terminal(format!("decoding composition: {}", e)))
            })
            .collect()
    }

    async fn get_slice_meta(&self, name: &NamespacedName) -> Result<Option<SliceMeta>, ApiError> {
        // The status-only projection: fetch and drop spec rather than trust
        // any cache that may have pruned it differently.
        let body = self
            .rest
            .get_optional(&Self::crd_path("resourceslices", name), None)
            .await?;
        body.map(|b| {
            let slice: ResourceSlice = serde_json::from_value(b)
                .map_err(|e| ApiError::Terminal(format!("decoding resource slice: {}", e)))?;
            Ok(SliceMeta {
                metadata: slice.metadata,
                status: slice.status,
            })
        })
        .transpose()
    }

    async fn get_slice(&self, name: &NamespacedName) -> Result<Option<ResourceSlice>, ApiError> {
        let body = self
            .rest
            .get_optional(&Self::crd_path("resourceslices", name), None)
            .await?;
        body.map(|b| {
            serde_json::from_value(b)
                .map_err(|e| ApiError::Terminal(format!("decoding resource slice: {}", e)))
        })
        .transpose()
    }

    async fn update_slice_status(
        &self,
        name: &NamespacedName,
        resource_version: &str,
        status: &ResourceSliceStatus,
    ) -> Result<(), ApiError> {
        let path = format!("{}/status", Self::crd_path("resourceslices", name));
        let body = json!({
            "apiVersion": format!("{}/{}", API_GROUP, API_VERSION),
            "kind": "ResourceSlice",
            "metadata": {
                "name": name.name,
                "namespace": name.namespace,
                "resourceVersion": resource_version,
            },
            "status": status,
        });
        let req = self.rest.request(Method::PUT, &path).json(&body);
        self.rest.execute(req).await?;
        Ok(())
    }
}
