use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use eno_domain::annotations::parse_duration;
use eno_expr::PathExpr;
use eno_reconciler::Migration;

#[derive(Debug, Parser)]
#[command(
    name = "eno",
    about = "Reconciles synthesized compositions onto a downstream API server",
    version
)]
pub struct Cli {
    /// Kubeconfig for the upstream cluster (Compositions, ResourceSlices).
    #[arg(long, env = "ENO_UPSTREAM_KUBECONFIG")]
    pub upstream_kubeconfig: PathBuf,

    /// Kubeconfig for the downstream cluster. Defaults to the upstream one
    /// (single-cluster deployments).
    #[arg(long, env = "ENO_DOWNSTREAM_KUBECONFIG")]
    pub downstream_kubeconfig: Option<PathBuf>,

    /// Per-request timeout against either API server.
    #[arg(long, default_value = "15s", value_parser = duration_arg)]
    pub resource_timeout: Duration,

    /// How often not-yet-ready resources are re-polled.
    #[arg(long, default_value = "5s", value_parser = duration_arg)]
    pub readiness_poll_interval: Duration,

    /// Floor for the per-resource reconcile-interval annotation.
    #[arg(long, default_value = "1s", value_parser = duration_arg)]
    pub min_reconcile_interval: Duration,

    /// Debounce window for ResourceSlice status writes.
    #[arg(long, default_value = "500ms", value_parser = duration_arg)]
    pub status_flush_interval: Duration,

    /// How often the source loop re-lists compositions.
    #[arg(long, default_value = "15s", value_parser = duration_arg)]
    pub composition_poll_interval: Duration,

    /// Parallel reconcile workers.
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Downstream API request budget.
    #[arg(long, default_value_t = 20.0)]
    pub downstream_qps: f64,
    #[arg(long, default_value_t = 50)]
    pub downstream_burst: u32,

    /// Upstream API request budget.
    #[arg(long, default_value_t = 10.0)]
    pub upstream_qps: f64,
    #[arg(long, default_value_t = 20)]
    pub upstream_burst: u32,

    /// OpenAPI discovery budget (deliberately low; the document is large).
    #[arg(long, default_value_t = 0.5)]
    pub discovery_qps: f64,

    /// Clear and refill the discovery cache once when a GVK lookup misses,
    /// picking up freshly installed CRDs.
    #[arg(long)]
    pub rediscover_when_not_found: bool,

    /// Use plain creates and computed patches instead of server-side apply.
    #[arg(long)]
    pub disable_ssa: bool,

    /// Expression over `self` (the desired manifest); resources it rejects
    /// are not reconciled.
    #[arg(long, env = "ENO_RESOURCE_FILTER")]
    pub resource_filter: Option<String>,

    /// Field managers whose ownership of migration scopes is taken over.
    #[arg(long, value_delimiter = ',')]
    pub migrating_field_managers: Vec<String>,

    /// Migration scopes, `group/Kind=self.path.to.field` (repeatable).
    /// Core-group kinds omit the group: `ConfigMap=self.data`.
    #[arg(long = "migration", value_parser = migration_arg)]
    pub migrations: Vec<Migration>,

    /// Grace period during which writes into a missing namespace are
    /// treated as "pending namespace creation".
    #[arg(long, default_value = "2m", value_parser = duration_arg)]
    pub namespace_grace: Duration,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn migration_arg(s: &str) -> Result<Migration, String> {
    let (gvk, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected group/Kind=self.path, got {:?}", s))?;
    let (group, kind) = match gvk.split_once('/') {
        Some((g, k)) => (g.to_string(), k.to_string()),
        None => (String::new(), gvk.to_string()),
    };
    if kind.is_empty() {
        return Err(format!("missing kind in {:?}", s));
    }
    let scope = PathExpr::parse(path).map_err(|e| e.to_string())?;
    Ok(Migration { group, kind, scope })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_arg_parses_grouped_and_core_kinds() {
        let m = migration_arg("apps/Deployment=self.spec.template.spec.initContainers").unwrap();
        assert_eq!(m.group, "apps");
        assert_eq!(m.kind, "Deployment");

        let m = migration_arg("ConfigMap=self.data").unwrap();
        assert_eq!(m.group, "");
        assert_eq!(m.kind, "ConfigMap");

        assert!(migration_arg("no-equals").is_err());
        assert!(migration_arg("apps/Deployment=not.a.path").is_err());
    }

    #[test]
    fn duration_arg_accepts_go_style_strings() {
        assert_eq!(duration_arg("500ms").unwrap(), Duration::from_millis(500));
        assert!(duration_arg("half an hour").is_err());
    }

    #[test]
    fn cli_parses_a_representative_command_line() {
        let cli = Cli::parse_from([
            "eno",
            "--upstream-kubeconfig",
            "/etc/eno/upstream.yaml",
            "--concurrency",
            "4",
            "--migrating-field-managers",
            "legacy-tool,old-updater",
            "--migration",
            "apps/Deployment=self.spec.template.spec.initContainers",
            "--rediscover-when-not-found",
        ]);
        assert_eq!(cli.concurrency, 4);
        assert_eq!(
            cli.migrating_field_managers,
            vec!["legacy-tool".to_string(), "old-updater".to_string()]
        );
        assert_eq!(cli.migrations.len(), 1);
        assert!(cli.rediscover_when_not_found);
        assert!(cli.downstream_kubeconfig.is_none());
    }
}
