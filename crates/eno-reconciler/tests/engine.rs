use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use eno_api::{
    ApiError, DiscoveryCache, DownstreamApi, InMemoryUpstream, LocalDownstream, UpstreamApi,
};
use eno_cache::{ReconstitutionCache, Request};
use eno_domain::{
    Composition, CompositionStatus, Gvk, Manifest, ManifestRef, Metadata, NamespacedName,
    ResourceRef, ResourceSlice, ResourceSliceSpec, SliceRef, Synthesis,
};
use eno_expr::{path_managed_by, PathExpr, Program};
use eno_merge::analyze_ownership;
use eno_queue::Queue;
use eno_reconciler::{
    sync_composition, Action, DeferReason, Migration, Options, Outcome, Reconciler,
};
use eno_status::StatusWriter;

// ── Harness ───────────────────────────────────────────────────────────────────

struct Harness {
    upstream: Arc<InMemoryUpstream>,
    downstream: Arc<LocalDownstream>,
    cache: Arc<ReconstitutionCache>,
    queue: Arc<Queue<Request>>,
    writer: Arc<StatusWriter>,
    reconciler: Arc<Reconciler>,
}

fn harness(options: Options) -> Harness {
    let upstream = Arc::new(InMemoryUpstream::new());
    let downstream = Arc::new(LocalDownstream::default());
    let cache = Arc::new(ReconstitutionCache::new());
    let queue = Arc::new(Queue::new());
    let up_dyn: Arc<dyn UpstreamApi> = upstream.clone();
    let down_dyn: Arc<dyn DownstreamApi> = downstream.clone();
    let writer = StatusWriter::new(up_dyn.clone(), Duration::from_millis(1));
    let discovery = Arc::new(DiscoveryCache::new(down_dyn.clone(), 1000.0, false));
    let reconciler = Arc::new(Reconciler::new(
        up_dyn,
        down_dyn,
        cache.clone(),
        discovery,
        writer.clone(),
        options,
    ));
    Harness {
        upstream,
        downstream,
        cache,
        queue,
        writer,
        reconciler,
    }
}

impl Harness {
    async fn seed(&self, comp: &Composition, slices: Vec<ResourceSlice>) {
        self.upstream.put_composition(comp.clone());
        for s in slices {
            self.upstream.put_slice(s);
        }
        let up_dyn: Arc<dyn UpstreamApi> = self.upstream.clone();
        sync_composition(&up_dyn, &self.cache, &self.queue, comp)
            .await
            .unwrap();
    }

    /// One reconcile followed by a status flush.
    async fn reconcile(&self, slice: &str, index: usize) -> Outcome {
        let outcome = self
            .reconciler
            .reconcile(&request(slice, index))
            .await
            .unwrap();
        self.writer.drain_once().await;
        outcome
    }

    fn slice_state(&self, slice: &str, index: usize) -> Option<eno_domain::ResourceState> {
        self.upstream
            .slice_status(&NamespacedName::new("default", slice))
            .and_then(|s| s.resources.get(index).cloned())
    }
}

fn request(slice: &str, index: usize) -> Request {
    Request {
        composition: NamespacedName::new("default", "comp"),
        manifest_ref: ManifestRef {
            slice: NamespacedName::new("default", slice),
            index,
        },
    }
}

fn composition(current: Option<Synthesis>, previous: Option<Synthesis>) -> Composition {
    Composition {
        metadata: Metadata {
            name: "comp".into(),
            namespace: "default".into(),
            ..Default::default()
        },
        status: CompositionStatus {
            current_synthesis: current,
            previous_synthesis: previous,
        },
        ..Default::default()
    }
}

fn synthesis(uuid: Uuid, slices: &[&str]) -> Synthesis {
    Synthesis {
        uuid,
        resource_slices: slices
            .iter()
            .map(|s| SliceRef {
                name: s.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

fn slice(name: &str, manifests: Vec<Value>) -> ResourceSlice {
    ResourceSlice {
        metadata: Metadata {
            name: name.into(),
            namespace: "default".into(),
            ..Default::default()
        },
        spec: ResourceSliceSpec {
            resources: manifests
                .into_iter()
                .map(|m| Manifest {
                    manifest: m.to_string(),
                    deleted: false,
                })
                .collect(),
        },
        ..Default::default()
    }
}

fn action_of(outcome: &Outcome) -> Action {
    match outcome {
        Outcome::Done { action, .. } => *action,
        other => panic!("expected Done, got {:?}", other),
    }
}

fn ready_of(outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Done { ready, .. } => *ready,
        other => panic!("expected Done, got {:?}", other),
    }
}

fn cm_ref(name: &str) -> ResourceRef {
    ResourceRef {
        group: "".into(),
        kind: "ConfigMap".into(),
        name: name.into(),
        namespace: "default".into(),
    }
}

fn configmap(name: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "default"},
        "data": data,
    })
}

// ── Create / patch / idempotence ──────────────────────────────────────────────

#[tokio::test]
async fn creates_then_short_circuits_on_unchanged_objects() {
    let h = harness(Options::default());
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![configmap("cm", json!({"k": "v"}))])])
        .await;

    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Created);
    assert!(ready_of(&outcome));

    let stored = h.downstream.stored(&cm_ref("cm")).unwrap();
    assert_eq!(stored["data"]["k"], "v");
    let rv_after_create = stored["metadata"]["resourceVersion"].clone();

    // Unchanged object: the metadata fast path reports NoOp and nothing
    // is written.
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::NoOp);
    let stored = h.downstream.stored(&cm_ref("cm")).unwrap();
    assert_eq!(stored["metadata"]["resourceVersion"], rv_after_create);

    let state = h.slice_state("s0", 0).unwrap();
    assert!(state.reconciled);
    assert!(state.ready.is_some());
}

#[tokio::test]
async fn converged_objects_with_external_fields_get_no_patch() {
    let h = harness(Options::default());
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![configmap("cm", json!({"k": "v"}))])])
        .await;
    h.reconcile("s0", 0).await;

    // Another manager adds a field eno never asked for.
    h.downstream.write_as(
        "kubectl",
        "Update",
        &Gvk::new("", "v1", "ConfigMap"),
        configmap("cm", json!({"external": "keep"})),
    );
    let rv_after_external = h.downstream.stored(&cm_ref("cm")).unwrap()["metadata"]
        ["resourceVersion"]
        .clone();

    // The resourceVersion moved, so the full path runs — and computes an
    // empty patch: desired matches current, the external field is neither
    // in prev nor desired.
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::NoOp);
    let stored = h.downstream.stored(&cm_ref("cm")).unwrap();
    assert_eq!(stored["metadata"]["resourceVersion"], rv_after_external);
    assert_eq!(stored["data"]["external"], "keep");
}

#[tokio::test]
async fn reconcile_interval_restores_external_drift() {
    let h = harness(Options::default());
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    let mut cm = configmap("cm", json!({"k": "desired"}));
    cm["metadata"]["annotations"] = json!({"eno.azure.io/reconcile-interval": "100ms"});
    h.seed(&comp, vec![slice("s0", vec![cm])]).await;

    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Created);
    match outcome {
        Outcome::Done {
            reconcile_interval, ..
        } => assert_eq!(reconcile_interval, Some(Duration::from_millis(100))),
        other => panic!("expected Done, got {:?}", other),
    }

    // External drift on a field eno owns.
    h.downstream.write_as(
        "kubectl",
        "Update",
        &Gvk::new("", "v1", "ConfigMap"),
        configmap("cm", json!({"k": "drifted"})),
    );

    // The next periodic pass converges it back.
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Patched);
    let stored = h.downstream.stored(&cm_ref("cm")).unwrap();
    assert_eq!(stored["data"]["k"], "desired");
}

// ── E2E CRUD with strategic merge ─────────────────────────────────────────────

#[tokio::test]
async fn strategic_merge_preserves_external_list_members() {
    let h = harness(Options::default());
    let gvk = Gvk::new("", "v1", "Service");
    let svc = |ports: Value| {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "default"},
            "spec": {"ports": ports},
        })
    };

    let syn_a = synthesis(Uuid::new_v4(), &["s0"]);
    let comp = composition(Some(syn_a.clone()), None);
    h.seed(
        &comp,
        vec![slice(
            "s0",
            vec![svc(json!([{"name": "a", "port": 1234, "protocol": "TCP"}]))],
        )],
    )
    .await;
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Created);

    // External writer adds a second port.
    h.downstream.write_as(
        "kubectl",
        "Update",
        &gvk,
        svc(json!([{"name": "b", "port": 2345, "protocol": "TCP"}])),
    );

    // Re-synthesis replaces port a with port c, under a fresh slice name.
    let syn_b = synthesis(Uuid::new_v4(), &["s1"]);
    let comp = composition(Some(syn_b), Some(syn_a));
    h.seed(
        &comp,
        vec![slice(
            "s1",
            vec![svc(json!([{"name": "c", "port": 3456, "protocol": "TCP"}]))],
        )],
    )
    .await;
    let outcome = h.reconcile("s1", 0).await;
    assert_eq!(action_of(&outcome), Action::Patched);

    let target = ResourceRef {
        group: "".into(),
        kind: "Service".into(),
        name: "svc".into(),
        namespace: "default".into(),
    };
    let ports = h.downstream.stored(&target).unwrap()["spec"]["ports"].clone();
    let names: Vec<String> = ports
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"b".to_string()), "external port kept: {:?}", names);
    assert!(names.contains(&"c".to_string()), "new port added: {:?}", names);
    assert!(!names.contains(&"a".to_string()), "old port removed: {:?}", names);
}

// ── Readiness ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn readiness_expression_gates_ready_time() {
    let h = harness(Options::default());
    let cm_with = |foo: &str| {
        let mut doc = configmap("cm", json!({"foo": foo}));
        doc["metadata"]["annotations"] =
            json!({"eno.azure.io/readiness": "self.data.foo == 'baz'"});
        doc
    };

    let syn_a = synthesis(Uuid::new_v4(), &["s0"]);
    h.seed(
        &composition(Some(syn_a.clone()), None),
        vec![slice("s0", vec![cm_with("bar")])],
    )
    .await;

    let outcome = h.reconcile("s0", 0).await;
    assert!(!ready_of(&outcome));
    let state = h.slice_state("s0", 0).unwrap();
    assert!(state.reconciled);
    assert!(state.ready.is_none());

    // Re-synthesize with the value the check wants.
    let syn_b = synthesis(Uuid::new_v4(), &["s1"]);
    h.seed(
        &composition(Some(syn_b), Some(syn_a)),
        vec![slice("s1", vec![cm_with("baz")])],
    )
    .await;
    let outcome = h.reconcile("s1", 0).await;
    assert_eq!(action_of(&outcome), Action::Patched);
    assert!(ready_of(&outcome));
    assert!(h.slice_state("s1", 0).unwrap().ready.is_some());

    // Sticky: later reconciles keep the recorded time.
    let outcome = h.reconcile("s1", 0).await;
    assert!(ready_of(&outcome));
}

// ── Overrides ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn override_yields_to_external_writer() {
    let h = harness(Options::default());
    let ops = json!([
        {"path": "self.data.foo", "value": "eno-value", "condition": "!has(self.data.foo)"},
    ]);
    let mut cm = configmap("cm", json!({}));
    cm["metadata"]["annotations"] = json!({"eno.azure.io/overrides": ops.to_string()});

    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![cm])]).await;

    // No downstream object yet: the override fires and seeds the value.
    h.reconcile("s0", 0).await;
    let stored = h.downstream.stored(&cm_ref("cm")).unwrap();
    assert_eq!(stored["data"]["foo"], "eno-value");

    // An external writer takes the field over; the condition now holds it
    // back and the engine leaves the external value in place.
    h.downstream.write_as(
        "kubectl",
        "Update",
        &Gvk::new("", "v1", "ConfigMap"),
        configmap("cm", json!({"foo": "external-value"})),
    );
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::NoOp);
    let stored = h.downstream.stored(&cm_ref("cm")).unwrap();
    assert_eq!(stored["data"]["foo"], "external-value");
}

// ── Ordering: readiness groups ────────────────────────────────────────────────

#[tokio::test]
async fn higher_readiness_groups_wait_for_lower_ones() {
    let h = harness(Options::default());

    let mut db = configmap("db", json!({}));
    db["metadata"]["annotations"] = json!({
        "eno.azure.io/readiness-group": "0",
        "eno.azure.io/readiness": "has(self.data.initialized)",
    });
    let mut app = configmap("app", json!({"run": "yes"}));
    app["metadata"]["annotations"] = json!({"eno.azure.io/readiness-group": "1"});

    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![db, app])]).await;

    // The app (group 1) is blocked until the db (group 0) reports Ready.
    let outcome = h.reconcile("s0", 1).await;
    assert!(
        matches!(outcome, Outcome::Deferred(DeferReason::ReadinessGroup(_))),
        "{:?}",
        outcome
    );
    assert!(h.downstream.stored(&cm_ref("app")).is_none());

    // Create the db; its readiness check does not pass yet.
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Created);
    assert!(!ready_of(&outcome));
    let outcome = h.reconcile("s0", 1).await;
    assert!(matches!(outcome, Outcome::Deferred(_)));

    // The db initializes out of band (a field eno does not manage).
    h.downstream.write_as(
        "db-operator",
        "Update",
        &Gvk::new("", "v1", "ConfigMap"),
        configmap("db", json!({"initialized": "true"})),
    );
    let outcome = h.reconcile("s0", 0).await;
    assert!(ready_of(&outcome));

    // Group 1 is now free to go.
    let outcome = h.reconcile("s0", 1).await;
    assert_eq!(action_of(&outcome), Action::Created);
    assert!(h.downstream.stored(&cm_ref("app")).is_some());
}

// ── Ordering: deletion groups ─────────────────────────────────────────────────

#[tokio::test]
async fn deletion_proceeds_in_ascending_group_order() {
    let h = harness(Options::default());
    let with_group = |name: &str, group: i64| {
        let mut doc = configmap(name, json!({}));
        doc["metadata"]["annotations"] =
            json!({"eno.azure.io/deletion-group": group.to_string()});
        doc
    };

    let syn = synthesis(Uuid::new_v4(), &["s0"]);
    let comp = composition(Some(syn.clone()), None);
    h.seed(
        &comp,
        vec![slice(
            "s0",
            vec![with_group("crd", -1), with_group("cm", 0), with_group("deploy", 1)],
        )],
    )
    .await;
    for i in 0..3 {
        h.reconcile("s0", i).await;
    }

    // Composition starts deleting.
    let mut deleting = composition(Some(syn), None);
    deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
    h.upstream.put_composition(deleting);

    // Higher groups are blocked while lower ones still exist.
    let outcome = h.reconcile("s0", 2).await;
    assert!(matches!(
        outcome,
        Outcome::Deferred(DeferReason::DeletionOrdering(_))
    ));
    let outcome = h.reconcile("s0", 1).await;
    assert!(matches!(
        outcome,
        Outcome::Deferred(DeferReason::DeletionOrdering(_))
    ));

    // Group -1 goes first; once its status records Deleted, group 0
    // unblocks, and so on.
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Deleted);
    h.reconcile("s0", 0).await; // observe deletion, record status
    assert!(h.slice_state("s0", 0).unwrap().deleted);

    let outcome = h.reconcile("s0", 1).await;
    assert_eq!(action_of(&outcome), Action::Deleted);
    h.reconcile("s0", 1).await;
    assert!(h.slice_state("s0", 1).unwrap().deleted);

    let outcome = h.reconcile("s0", 2).await;
    assert_eq!(action_of(&outcome), Action::Deleted);
    h.reconcile("s0", 2).await;
    assert!(h.slice_state("s0", 2).unwrap().deleted);
    assert!(h.downstream.stored(&cm_ref("crd")).is_none());
    assert!(h.downstream.stored(&cm_ref("deploy")).is_none());
}

// ── Suspend / orphan / cache coherence ────────────────────────────────────────

#[tokio::test]
async fn suspended_compositions_touch_nothing() {
    let h = harness(Options::default());
    let mut comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    comp.spec.suspend = true;
    h.seed(&comp, vec![slice("s0", vec![configmap("cm", json!({"k": "v"}))])])
        .await;

    let outcome = h.reconcile("s0", 0).await;
    assert!(matches!(outcome, Outcome::Drop));
    assert!(h.downstream.stored(&cm_ref("cm")).is_none());
}

#[tokio::test]
async fn orphan_strategy_skips_downstream_deletes() {
    let h = harness(Options::default());
    let syn = synthesis(Uuid::new_v4(), &["s0"]);
    let mut comp = composition(Some(syn.clone()), None);
    comp.metadata.annotations.insert(
        "eno.azure.io/deletion-strategy".into(),
        "orphan".into(),
    );
    h.seed(&comp, vec![slice("s0", vec![configmap("cm", json!({"k": "v"}))])])
        .await;
    h.reconcile("s0", 0).await;
    assert!(h.downstream.stored(&cm_ref("cm")).is_some());

    let mut deleting = comp.clone();
    deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
    h.upstream.put_composition(deleting);

    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::NoOp);
    // Status shows deleted, the object itself survives.
    assert!(h.slice_state("s0", 0).unwrap().deleted);
    assert!(h.downstream.stored(&cm_ref("cm")).is_some());
}

#[tokio::test]
async fn superseded_work_items_drop_without_downstream_effect() {
    let h = harness(Options::default());
    let syn_a = synthesis(Uuid::new_v4(), &["s0"]);
    h.seed(
        &composition(Some(syn_a.clone()), None),
        vec![slice("s0", vec![configmap("old", json!({}))])],
    )
    .await;

    // A new synthesis supersedes A entirely (A is not even previous).
    let syn_b = synthesis(Uuid::new_v4(), &["s1"]);
    h.seed(
        &composition(Some(syn_b), None),
        vec![slice("s1", vec![configmap("new", json!({}))])],
    )
    .await;

    // The old queue item refers to a purged synthesis: dropped.
    let outcome = h.reconcile("s0", 0).await;
    assert!(matches!(outcome, Outcome::Drop));
    assert!(h.downstream.stored(&cm_ref("old")).is_none());
}

#[tokio::test]
async fn resource_filter_drops_unmatched_resources() {
    let h = harness(Options {
        resource_filter: Some(Program::compile("self.kind != 'ConfigMap'").unwrap()),
        ..Default::default()
    });
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![configmap("cm", json!({}))])])
        .await;
    let outcome = h.reconcile("s0", 0).await;
    assert!(matches!(outcome, Outcome::Drop));
    assert!(h.downstream.stored(&cm_ref("cm")).is_none());
}

// ── Failure policy ────────────────────────────────────────────────────────────

#[tokio::test]
async fn fail_open_marks_reconciled_despite_write_failure() {
    let h = harness(Options::default());
    let mut cm = configmap("cm", json!({"k": "v"}));
    cm["metadata"]["annotations"] = json!({"eno.azure.io/fail-open": "true"});
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![cm])]).await;

    h.downstream
        .inject_error(ApiError::Transient("backend down".into()));
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::NoOp);
    assert!(h.slice_state("s0", 0).unwrap().reconciled);
    assert!(h.downstream.stored(&cm_ref("cm")).is_none());
}

#[tokio::test]
async fn transient_failures_surface_without_fail_open() {
    let h = harness(Options::default());
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![configmap("cm", json!({}))])])
        .await;

    h.downstream
        .inject_error(ApiError::Transient("backend down".into()));
    let err = h
        .reconciler
        .reconcile(&request("s0", 0))
        .await
        .unwrap_err();
    assert!(!err.is_terminal());
}

#[tokio::test]
async fn missing_namespace_defers_within_grace() {
    let h = harness(Options::default());
    h.downstream.set_namespaces(&["default"]);
    let cm = json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "cm", "namespace": "not-yet"},
    });
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(&comp, vec![slice("s0", vec![cm])]).await;

    let outcome = h.reconcile("s0", 0).await;
    assert!(matches!(
        outcome,
        Outcome::Deferred(DeferReason::PendingNamespace(ns)) if ns == "not-yet"
    ));
}

// ── Ownership migration ───────────────────────────────────────────────────────

fn deployment(init_image: Option<&str>) -> Value {
    let mut doc = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"template": {"spec": {
            "containers": [{"name": "main", "image": "app:v1"}],
        }}},
    });
    if let Some(image) = init_image {
        doc["spec"]["template"]["spec"]["initContainers"] =
            json!([{"name": "init", "image": image}]);
    }
    doc
}

fn deploy_ref() -> ResourceRef {
    ResourceRef {
        group: "apps".into(),
        kind: "Deployment".into(),
        name: "web".into(),
        namespace: "default".into(),
    }
}

fn migration_options(managers: &[&str]) -> Options {
    Options {
        migrating_field_managers: managers.iter().map(|s| s.to_string()).collect(),
        migrations: vec![Migration {
            group: "apps".into(),
            kind: "Deployment".into(),
            scope: PathExpr::parse("self.spec.template.spec.initContainers").unwrap(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn migrates_scope_from_legacy_apply_manager() {
    let h = harness(migration_options(&["legacy-tool"]));
    let gvk = Gvk::new("apps", "v1", "Deployment");
    h.downstream
        .write_as("legacy-tool", "Apply", &gvk, deployment(Some("init:v1")));

    let syn_a = synthesis(Uuid::new_v4(), &["s0"]);
    h.seed(
        &composition(Some(syn_a.clone()), None),
        vec![slice("s0", vec![deployment(Some("init:v2"))])],
    )
    .await;
    h.reconcile("s0", 0).await;

    let stored = h.downstream.stored(&deploy_ref()).unwrap();
    assert_eq!(
        stored["spec"]["template"]["spec"]["initContainers"][0]["image"],
        "init:v2"
    );
    let scope = PathExpr::parse("self.spec.template.spec.initContainers").unwrap();
    let status = analyze_ownership(
        &stored["metadata"]["managedFields"],
        &scope,
        "eno",
    );
    assert!(status.scope_exists);
    assert!(status.fully_owned_by_eno, "{:?}", status);

    // A later synthesis drops the initContainers; since eno now owns the
    // field it is removed downstream.
    let syn_b = synthesis(Uuid::new_v4(), &["s1"]);
    h.seed(
        &composition(Some(syn_b), Some(syn_a)),
        vec![slice("s1", vec![deployment(None)])],
    )
    .await;
    let outcome = h.reconcile("s1", 0).await;
    assert_eq!(action_of(&outcome), Action::Patched);
    let stored = h.downstream.stored(&deploy_ref()).unwrap();
    assert!(
        stored["spec"]["template"]["spec"].get("initContainers").is_none(),
        "{}",
        stored["spec"]["template"]["spec"]
    );
}

#[tokio::test]
async fn strips_scope_from_legacy_update_manager() {
    let h = harness(migration_options(&["old-updater"]));
    let gvk = Gvk::new("apps", "v1", "Deployment");
    h.downstream
        .write_as("old-updater", "Update", &gvk, deployment(Some("init:v1")));

    h.seed(
        &composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None),
        vec![slice("s0", vec![deployment(Some("init:v2"))])],
    )
    .await;
    h.reconcile("s0", 0).await;

    let stored = h.downstream.stored(&deploy_ref()).unwrap();
    // The update manager no longer records ownership of the scope.
    let scope = PathExpr::parse("self.spec.template.spec.initContainers").unwrap();
    assert!(!path_managed_by(
        "old-updater",
        &stored["metadata"]["managedFields"],
        &scope.to_field_path()
    ));
    // And the desired image landed.
    assert_eq!(
        stored["spec"]["template"]["spec"]["initContainers"][0]["image"],
        "init:v2"
    );
}

#[tokio::test]
async fn unlisted_managers_are_left_alone() {
    let h = harness(migration_options(&["legacy-tool"]));
    let gvk = Gvk::new("apps", "v1", "Deployment");
    h.downstream
        .write_as("somebody-else", "Apply", &gvk, deployment(Some("init:v1")));

    h.seed(
        &composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None),
        vec![slice("s0", vec![deployment(Some("init:v2"))])],
    )
    .await;
    h.reconcile("s0", 0).await;

    let stored = h.downstream.stored(&deploy_ref()).unwrap();
    let scope = PathExpr::parse("self.spec.template.spec.initContainers").unwrap();
    // Migration did not touch the unlisted manager's entry...
    let status = analyze_ownership(&stored["metadata"]["managedFields"], &scope, "eno");
    assert!(!status.fully_owned_by_eno);
}

// ── Patch pseudo-resource ─────────────────────────────────────────────────────

fn patch_resource(name: &str, ops: Value) -> Value {
    json!({
        "apiVersion": "eno.azure.io/v1",
        "kind": "Patch",
        "metadata": {"name": name, "namespace": "default"},
        "patch": {
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "ops": ops,
        },
    })
}

#[tokio::test]
async fn patch_resource_mutates_existing_target_only() {
    let h = harness(Options::default());
    let gvk = Gvk::new("", "v1", "ConfigMap");
    h.downstream
        .write_as("someone", "Update", &gvk, configmap("target", json!({"k": "v"})));

    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(
        &comp,
        vec![slice(
            "s0",
            vec![patch_resource(
                "target",
                json!([{"op": "add", "path": "/data/injected", "value": "x"}]),
            )],
        )],
    )
    .await;

    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Patched);
    let stored = h.downstream.stored(&cm_ref("target")).unwrap();
    assert_eq!(stored["data"]["injected"], "x");

    // Converged: the ops preview matches, no write happens.
    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::NoOp);
}

#[tokio::test]
async fn patch_resource_never_creates_its_target() {
    let h = harness(Options::default());
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(
        &comp,
        vec![slice(
            "s0",
            vec![patch_resource(
                "absent",
                json!([{"op": "add", "path": "/data/x", "value": "y"}]),
            )],
        )],
    )
    .await;

    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::NoOp);
    assert!(ready_of(&outcome));
    assert!(h.downstream.stored(&cm_ref("absent")).is_none());
    assert!(h.slice_state("s0", 0).unwrap().reconciled);
}

#[tokio::test]
async fn patch_resource_deletion_op_deletes_target() {
    let h = harness(Options::default());
    let gvk = Gvk::new("", "v1", "ConfigMap");
    h.downstream
        .write_as("someone", "Update", &gvk, configmap("doomed", json!({})));

    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(
        &comp,
        vec![slice(
            "s0",
            vec![patch_resource(
                "doomed",
                json!([{"op": "add", "path": "/metadata/deletionTimestamp", "value": "now"}]),
            )],
        )],
    )
    .await;

    let outcome = h.reconcile("s0", 0).await;
    assert_eq!(action_of(&outcome), Action::Deleted);
    assert!(h.downstream.stored(&cm_ref("doomed")).is_none());
}

// ── Full loop with workers ────────────────────────────────────────────────────

#[tokio::test]
async fn workers_drive_a_composition_to_ready() {
    let h = harness(Options {
        readiness_poll_interval: Duration::from_millis(5),
        ..Default::default()
    });
    let comp = composition(Some(synthesis(Uuid::new_v4(), &["s0"])), None);
    h.seed(
        &comp,
        vec![slice(
            "s0",
            vec![
                configmap("one", json!({"k": "1"})),
                configmap("two", json!({"k": "2"})),
            ],
        )],
    )
    .await;

    let writer_task = tokio::spawn(h.writer.clone().run());
    let mut workers = Vec::new();
    for _ in 0..2 {
        workers.push(tokio::spawn(eno_reconciler::run_worker(
            h.reconciler.clone(),
            h.queue.clone(),
        )));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let ready = (0..2).all(|i| {
                h.slice_state("s0", i)
                    .map_or(false, |s| s.reconciled && s.ready.is_some())
            });
            if ready && h.downstream.stored(&cm_ref("one")).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("composition should converge");

    h.queue.shut_down();
    for w in workers {
        w.await.unwrap();
    }
    writer_task.abort();
}
