use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use eno_api::{
    ApiError, DiscoveryCache, DownstreamApi, ObjectMeta, PatchStrategy, PatchType, UpstreamApi,
};
use eno_cache::{ReconstitutionCache, Request};
use eno_domain::{
    aggregate_ready_times, Composition, ManifestRef, Resource, ResourcePatch, ResourceState,
    SynthesisRef,
};
use eno_expr::Context;
use eno_merge::{
    analyze_ownership, extract_scope, munge_patch, strip_scope_from, three_way_merge,
    three_way_strategic,
};
use eno_status::StatusWriter;

use crate::error::ReconcileError;
use crate::options::Options;
use crate::ordering::{deletion_blocked, readiness_gate_blocked};
use crate::overrides::apply_overrides;

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// What a reconcile did downstream. Exactly one action per reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Patched,
    Deleted,
    NoOp,
}

#[derive(Debug, Clone)]
pub enum DeferReason {
    /// A sibling in the next-lower readiness group is not Ready yet.
    ReadinessGroup(ManifestRef),
    /// A resource in a lower deletion group is not Deleted yet.
    DeletionOrdering(String),
    /// The target namespace does not exist yet; within the grace period.
    PendingNamespace(String),
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// Nothing to do and nothing to wait for: cache superseded, composition
    /// gone or suspended, resource filtered out.
    Drop,
    /// Blocked on something another reconcile will change; try again later.
    Deferred(DeferReason),
    Done {
        action: Action,
        ready: bool,
        reconcile_interval: Option<Duration>,
    },
}

impl Outcome {
    fn done(action: Action, ready: bool, interval: Option<Duration>) -> Self {
        Outcome::Done {
            action,
            ready,
            reconcile_interval: interval,
        }
    }
}

// ── Reconciler ────────────────────────────────────────────────────────────────

/// The per-resource reconciler: drives one downstream object toward one
/// manifest of one synthesis.
pub struct Reconciler {
    pub upstream: Arc<dyn UpstreamApi>,
    pub downstream: Arc<dyn DownstreamApi>,
    pub cache: Arc<ReconstitutionCache>,
    pub discovery: Arc<DiscoveryCache>,
    pub status: Arc<StatusWriter>,
    pub options: Options,
    namespace_first_seen: Mutex<HashMap<String, Instant>>,
}

impl Reconciler {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        downstream: Arc<dyn DownstreamApi>,
        cache: Arc<ReconstitutionCache>,
        discovery: Arc<DiscoveryCache>,
        status: Arc<StatusWriter>,
        options: Options,
    ) -> Self {
        Reconciler {
            upstream,
            downstream,
            cache,
            discovery,
            status,
            options,
            namespace_first_seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn reconcile(&self, req: &Request) -> Result<Outcome, ReconcileError> {
        // Load the composition; most of the drop conditions live here.
        let comp = match self.upstream.get_composition(&req.composition).await? {
            Some(c) => c,
            None => return Ok(Outcome::Drop),
        };
        if comp.suspended() {
            debug!(composition = %req.composition, "composition suspended");
            return Ok(Outcome::Drop);
        }
        let current_ref = match comp.current_synthesis_ref() {
            Some(r) => r,
            None => return Ok(Outcome::Drop),
        };

        // Desired state; a miss means the work item refers to a superseded
        // synthesis and is dropped without downstream effect.
        let resource = match self.cache.get(&current_ref, &req.manifest_ref) {
            Some(r) => r,
            None => return Ok(Outcome::Drop),
        };
        // Previous desired state resolves by downstream identity — slice
        // names change across syntheses.
        let prev = comp
            .previous_synthesis_ref()
            .and_then(|r| self.cache.get_by_ref(&r, &resource.resource_ref));

        // Operator-level resource filter.
        if let Some(filter) = &self.options.resource_filter {
            let ctx = Context::new(&resource.parsed);
            if !filter.eval_bool(&ctx).unwrap_or(true) {
                return Ok(Outcome::Drop);
            }
        }

        let recorded = self.recorded_state(&req.manifest_ref).await?;

        if let Some(patch_spec) = resource.patch.clone() {
            return self
                .reconcile_patch(&comp, &resource, &patch_spec, recorded.as_ref())
                .await;
        }

        if resource.deleted || comp.deleting() {
            return self
                .reconcile_deletion(&comp, &current_ref, &resource, recorded.as_ref())
                .await;
        }

        // Fast path: a metadata-only read against the cached
        // resourceVersion short-circuits the whole reconcile.
        if let Some(last_seen) = resource.observed_version() {
            if let Some(meta) = self
                .downstream
                .get_metadata(&resource.gvk, &resource.resource_ref)
                .await?
            {
                if meta.resource_version.as_deref() == Some(last_seen.as_str()) && !meta.deleting()
                {
                    let ready = recorded.as_ref().map_or(false, |s| s.ready.is_some());
                    return Ok(Outcome::done(Action::NoOp, ready, resource.reconcile_interval));
                }
            }
        }

        // Creation/update ordering barrier.
        if let Some(blocking) =
            readiness_gate_blocked(&self.upstream, &self.cache, &current_ref, &resource).await?
        {
            debug!(resource = %resource.resource_ref, blocking = %blocking, "readiness group not ready");
            return Ok(Outcome::Deferred(DeferReason::ReadinessGroup(blocking)));
        }

        let current = self
            .downstream
            .get(&resource.gvk, &resource.resource_ref)
            .await?;
        let live = current.clone().unwrap_or(Value::Null);
        let (desired, replace) = apply_overrides(&resource, &comp, &live)?;

        if resource.disable_reconciliation {
            let ready = self.readiness(&resource, recorded.as_ref(), current.as_ref());
            self.push_status(&req.manifest_ref, false, ready);
            return Ok(Outcome::done(
                Action::NoOp,
                ready.is_some(),
                resource.reconcile_interval,
            ));
        }

        let (action, latest) = match current {
            None => match self.create(&resource, &desired).await {
                Ok(obj) => (Action::Created, Some(obj)),
                Err(e) => return self.handle_write_error(e, &comp, &resource, &req.manifest_ref),
            },
            Some(cur) => {
                let cur = self.migrate_ownership(&resource, cur, &desired).await?;
                match self.update(&resource, prev.as_deref(), &desired, &cur, replace).await {
                    Ok(Some(obj)) => (Action::Patched, Some(obj)),
                    Ok(None) => (Action::NoOp, Some(cur)),
                    Err(e) => {
                        return self.handle_write_error(e, &comp, &resource, &req.manifest_ref)
                    }
                }
            }
        };

        // Remember what we saw so the next pass can take the fast path.
        if let Some(obj) = &latest {
            resource.set_observed_version(ObjectMeta::from_object(obj).resource_version);
        }

        let ready = self.readiness(&resource, recorded.as_ref(), latest.as_ref());
        self.push_status(&req.manifest_ref, false, ready);
        Ok(Outcome::done(
            action,
            ready.is_some(),
            resource.reconcile_interval,
        ))
    }

    // ── Create / update ───────────────────────────────────────────────────────

    async fn create(&self, resource: &Resource, desired: &Value) -> Result<Value, ApiError> {
        if self.options.disable_ssa {
            self.downstream.create(&resource.gvk, desired).await
        } else {
            self.downstream
                .apply(&resource.gvk, &resource.resource_ref, desired, true)
                .await
        }
    }

    /// Returns the updated object, or `None` when the computed patch was a
    /// no-op.
    async fn update(
        &self,
        resource: &Resource,
        prev: Option<&Resource>,
        desired: &Value,
        current: &Value,
        replace: bool,
    ) -> Result<Option<Value>, ApiError> {
        if replace {
            let updated = if self.options.disable_ssa {
                let mut obj = desired.clone();
                if let Some(rv) = current
                    .pointer("/metadata/resourceVersion")
                    .and_then(Value::as_str)
                {
                    obj["metadata"]["resourceVersion"] = json!(rv);
                }
                self.downstream
                    .replace(&resource.gvk, &resource.resource_ref, &obj)
                    .await?
            } else {
                self.downstream
                    .apply(&resource.gvk, &resource.resource_ref, desired, true)
                    .await?
            };
            return Ok(Some(updated));
        }

        // Three-way merge: empty previous when the first synthesis (or a
        // compacted history) left none.
        let prev_manifest = prev.map(|p| p.parsed.clone()).unwrap_or_else(|| json!({}));
        let (patch, patch_type) = match self.discovery.patch_strategy(&resource.gvk).await? {
            PatchStrategy::StrategicMerge(schema) => (
                three_way_strategic(&prev_manifest, desired, current, schema.as_ref()),
                PatchType::StrategicMerge,
            ),
            PatchStrategy::JsonMerge => (
                three_way_merge(&prev_manifest, desired, current),
                PatchType::Merge,
            ),
        };

        let rv = current
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        match munge_patch(patch, rv) {
            None => Ok(None),
            Some(body) => {
                let updated = self
                    .downstream
                    .patch(&resource.gvk, &resource.resource_ref, patch_type, &body)
                    .await?;
                Ok(Some(updated))
            }
        }
    }

    // ── Deletion ──────────────────────────────────────────────────────────────

    async fn reconcile_deletion(
        &self,
        comp: &Composition,
        synthesis: &SynthesisRef,
        resource: &Resource,
        recorded: Option<&ResourceState>,
    ) -> Result<Outcome, ReconcileError> {
        if recorded.map_or(false, |s| s.deleted) {
            return Ok(Outcome::done(Action::NoOp, true, None));
        }

        // Cross-reconciler ordering, only under composition deletion and
        // only for resources that opted into a deletion group.
        if comp.deleting() && resource.deletion_group.is_some() {
            if let Some(reason) =
                deletion_blocked(&self.upstream, &self.cache, synthesis, resource).await?
            {
                return Ok(Outcome::Deferred(DeferReason::DeletionOrdering(reason)));
            }
        }

        // Orphaning: release the object instead of deleting it.
        if comp.deleting() && comp.orphans_on_deletion() {
            debug!(resource = %resource.resource_ref, "orphaning downstream object");
            self.push_status(&resource.manifest_ref, true, None);
            return Ok(Outcome::done(Action::NoOp, true, None));
        }

        let meta = self
            .downstream
            .get_metadata(&resource.gvk, &resource.resource_ref)
            .await?;
        match meta {
            None => {
                resource.set_observed_version(None);
                self.push_status(&resource.manifest_ref, true, None);
                Ok(Outcome::done(Action::NoOp, true, None))
            }
            Some(m) if m.deleting() => {
                // Deletion already in flight; poll until it completes.
                Ok(Outcome::done(Action::NoOp, false, None))
            }
            Some(_) => {
                match self
                    .downstream
                    .delete(&resource.gvk, &resource.resource_ref)
                    .await
                {
                    Ok(()) => Ok(Outcome::done(Action::Deleted, false, None)),
                    Err(e) => self.handle_write_error(e, comp, resource, &resource.manifest_ref),
                }
            }
        }
    }

    // ── Patch pseudo-resource ─────────────────────────────────────────────────

    async fn reconcile_patch(
        &self,
        comp: &Composition,
        resource: &Resource,
        patch: &ResourcePatch,
        recorded: Option<&ResourceState>,
    ) -> Result<Outcome, ReconcileError> {
        let gvk = &patch.target_gvk;
        let target = &resource.resource_ref;

        if resource.deleted || comp.deleting() {
            // The patch itself has no downstream footprint to clean up.
            self.push_status(&resource.manifest_ref, true, None);
            return Ok(Outcome::done(Action::NoOp, true, None));
        }

        let current = match self.downstream.get(gvk, target).await? {
            Some(c) => c,
            None => {
                // Patches never create their target.
                self.push_status(&resource.manifest_ref, false, Some(Utc::now()));
                return Ok(Outcome::done(Action::NoOp, true, resource.reconcile_interval));
            }
        };

        if patch.deletes_target() {
            if ObjectMeta::from_object(&current).deleting() {
                return Ok(Outcome::done(Action::NoOp, false, None));
            }
            self.downstream.delete(gvk, target).await?;
            return Ok(Outcome::done(Action::Deleted, false, None));
        }

        // Dry-run the ops locally: an already-converged target gets no
        // write at all.
        let ops: json_patch::Patch = serde_json::from_value(patch.ops.clone())
            .map_err(|e| ApiError::Terminal(format!("invalid patch ops: {}", e)))?;
        let mut preview = current.clone();
        json_patch::patch(&mut preview, &ops)
            .map_err(|e| ApiError::Terminal(format!("patch ops do not apply: {}", e)))?;

        let (action, latest) = if preview == current {
            (Action::NoOp, current)
        } else {
            let updated = self
                .downstream
                .patch(gvk, target, PatchType::Json, &patch.ops)
                .await?;
            (Action::Patched, updated)
        };

        let ready = self.readiness(resource, recorded, Some(&latest));
        self.push_status(&resource.manifest_ref, false, ready);
        Ok(Outcome::done(
            action,
            ready.is_some(),
            resource.reconcile_interval,
        ))
    }

    // ── Ownership migration ───────────────────────────────────────────────────

    /// Take over configured scopes from legacy field managers. Returns the
    /// freshest view of the object.
    async fn migrate_ownership(
        &self,
        resource: &Resource,
        current: Value,
        desired: &Value,
    ) -> Result<Value, ReconcileError> {
        let migrations: Vec<_> = self
            .options
            .migrations
            .iter()
            .filter(|m| m.group == resource.gvk.group && m.kind == resource.gvk.kind)
            .collect();
        if migrations.is_empty() || self.options.migrating_field_managers.is_empty() {
            return Ok(current);
        }

        let managed = match current.pointer("/metadata/managedFields") {
            Some(m) => m.clone(),
            None => return Ok(current),
        };

        let mut modified = false;
        for migration in migrations {
            let status = analyze_ownership(&managed, &migration.scope, eno_domain::FIELD_MANAGER);
            if !status.scope_exists || status.fully_owned_by_eno {
                continue;
            }
            let update_managers: Vec<String> = status
                .other_update_managers
                .iter()
                .filter(|m| self.options.migrating_field_managers.contains(m))
                .cloned()
                .collect();
            let apply_managers: Vec<String> = status
                .other_apply_managers
                .iter()
                .filter(|m| self.options.migrating_field_managers.contains(m))
                .cloned()
                .collect();

            if !update_managers.is_empty() {
                // Update-operation owners cannot be displaced by a forced
                // apply; rewrite their managedFields entries directly.
                if let Some(rewritten) = strip_scope_from(&managed, &update_managers, &migration.scope)
                {
                    debug!(resource = %resource.resource_ref, managers = ?update_managers,
                           "stripping scope from update managers");
                    self.downstream
                        .update_managed_fields(
                            &resource.gvk,
                            &resource.resource_ref,
                            &rewritten,
                        )
                        .await?;
                    modified = true;
                }
            } else if !apply_managers.is_empty() {
                // Apply-operation owners yield to a targeted forced apply
                // of just the contested scope.
                if let Some(payload) = extract_scope(desired, &migration.scope) {
                    debug!(resource = %resource.resource_ref, managers = ?apply_managers,
                           "force-applying scope to take ownership");
                    self.downstream
                        .apply(&resource.gvk, &resource.resource_ref, &payload, true)
                        .await?;
                    modified = true;
                }
            }
        }

        if modified {
            if let Some(fresh) = self
                .downstream
                .get(&resource.gvk, &resource.resource_ref)
                .await?
            {
                return Ok(fresh);
            }
        }
        Ok(current)
    }

    // ── Readiness & status ────────────────────────────────────────────────────

    /// Sticky readiness: a time already recorded in slice status wins.
    /// Zero checks mean ready as of now; otherwise every check must pass
    /// and the aggregate time is per the precision rules.
    fn readiness(
        &self,
        resource: &Resource,
        recorded: Option<&ResourceState>,
        current: Option<&Value>,
    ) -> Option<DateTime<Utc>> {
        if let Some(t) = recorded.and_then(|s| s.ready) {
            return Some(t);
        }
        let now = Utc::now();
        if resource.readiness_checks.is_empty() {
            return Some(now);
        }
        let obj = current?;
        let mut times = Vec::with_capacity(resource.readiness_checks.len());
        for check in &resource.readiness_checks {
            match check.eval(obj, now) {
                Some(t) => times.push(t),
                None => return None,
            }
        }
        aggregate_ready_times(&times).map(|t| t.time)
    }

    fn push_status(&self, manifest_ref: &ManifestRef, deleted: bool, ready: Option<DateTime<Utc>>) {
        self.status.patch_status_async(
            manifest_ref,
            Box::new(move |current: &ResourceState| {
                let mut next = current.clone();
                next.reconciled = true;
                next.deleted = deleted;
                if next.ready.is_none() {
                    next.ready = ready;
                }
                if &next == current {
                    None
                } else {
                    Some(next)
                }
            }),
        );
    }

    async fn recorded_state(
        &self,
        manifest_ref: &ManifestRef,
    ) -> Result<Option<ResourceState>, ApiError> {
        Ok(self
            .upstream
            .get_slice_meta(&manifest_ref.slice)
            .await?
            .and_then(|meta| meta.status.resources.get(manifest_ref.index).cloned()))
    }

    // ── Failure policy ────────────────────────────────────────────────────────

    fn handle_write_error(
        &self,
        error: ApiError,
        comp: &Composition,
        resource: &Resource,
        manifest_ref: &ManifestRef,
    ) -> Result<Outcome, ReconcileError> {
        if let ApiError::NamespaceMissing(ns) = &error {
            let within_grace = {
                let mut seen = match self.namespace_first_seen.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let first = seen.entry(ns.clone()).or_insert_with(Instant::now);
                first.elapsed() < self.options.namespace_grace
            };
            if within_grace {
                debug!(namespace = %ns, "waiting for namespace to appear");
                return Ok(Outcome::Deferred(DeferReason::PendingNamespace(ns.clone())));
            }
        }

        if resource.fail_open(comp.fail_open_default()) {
            warn!(resource = %resource.resource_ref, error = %error,
                  "write failed, continuing per fail-open");
            self.push_status(manifest_ref, false, None);
            return Ok(Outcome::done(
                Action::NoOp,
                false,
                resource.reconcile_interval,
            ));
        }
        Err(error.into())
    }
}
