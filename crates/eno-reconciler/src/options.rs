use std::time::Duration;

use eno_expr::{PathExpr, Program};

/// One GVK whose field ownership the engine migrates away from legacy
/// field managers (e.g. `apps/Deployment` at
/// `self.spec.template.spec.initContainers`).
#[derive(Debug, Clone)]
pub struct Migration {
    pub group: String,
    pub kind: String,
    pub scope: PathExpr,
}

/// Operator-level reconciler configuration.
pub struct Options {
    /// How often a not-yet-ready resource is re-polled.
    pub readiness_poll_interval: Duration,
    /// Floor applied to per-resource reconcile intervals.
    pub min_reconcile_interval: Duration,
    /// Replace server-side apply with plain creates and computed patches.
    pub disable_ssa: bool,
    /// Operator-supplied filter; resources it rejects are dropped.
    pub resource_filter: Option<Program>,
    /// Field managers whose ownership may be taken over.
    pub migrating_field_managers: Vec<String>,
    /// GVK scopes subject to ownership migration.
    pub migrations: Vec<Migration>,
    /// How long a missing downstream namespace is treated as "pending
    /// creation" before it degrades to a transient error.
    pub namespace_grace: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            readiness_poll_interval: Duration::from_secs(5),
            min_reconcile_interval: Duration::from_millis(50),
            disable_ssa: false,
            resource_filter: None,
            migrating_field_managers: Vec::new(),
            migrations: Vec::new(),
            namespace_grace: Duration::from_secs(120),
        }
    }
}
