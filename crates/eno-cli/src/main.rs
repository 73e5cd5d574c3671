mod cli;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use eno_api::{
    DiscoveryCache, DownstreamApi, HttpDownstream, HttpUpstream, Pacer, RestConfig, UpstreamApi,
};
use eno_cache::{ReconstitutionCache, Request};
use eno_domain::NamespacedName;
use eno_expr::Program;
use eno_queue::Queue;
use eno_reconciler::{
    forget_composition, run_worker, sync_composition, Options, Reconciler,
};
use eno_status::StatusWriter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let upstream_config = RestConfig::from_kubeconfig(&cli.upstream_kubeconfig, cli.resource_timeout)
        .context("loading upstream kubeconfig")?;
    let downstream_config = match &cli.downstream_kubeconfig {
        Some(path) => RestConfig::from_kubeconfig(path, cli.resource_timeout)
            .context("loading downstream kubeconfig")?,
        None => upstream_config.clone(),
    };

    let upstream: Arc<dyn UpstreamApi> = Arc::new(HttpUpstream::new(
        upstream_config,
        Arc::new(Pacer::new(cli.upstream_qps, cli.upstream_burst)),
    ));
    let downstream: Arc<dyn DownstreamApi> = Arc::new(HttpDownstream::new(
        downstream_config,
        Arc::new(Pacer::new(cli.downstream_qps, cli.downstream_burst)),
    ));
    let discovery = Arc::new(DiscoveryCache::new(
        downstream.clone(),
        cli.discovery_qps,
        cli.rediscover_when_not_found,
    ));

    let resource_filter = cli
        .resource_filter
        .as_deref()
        .map(Program::compile)
        .transpose()
        .context("compiling --resource-filter")?;

    let options = Options {
        readiness_poll_interval: cli.readiness_poll_interval,
        min_reconcile_interval: cli.min_reconcile_interval,
        disable_ssa: cli.disable_ssa,
        resource_filter,
        migrating_field_managers: cli.migrating_field_managers.clone(),
        migrations: cli.migrations.clone(),
        namespace_grace: cli.namespace_grace,
    };

    let cache = Arc::new(ReconstitutionCache::new());
    let queue: Arc<Queue<Request>> = Arc::new(Queue::new());
    let writer = StatusWriter::new(upstream.clone(), cli.status_flush_interval);
    let reconciler = Arc::new(Reconciler::new(
        upstream.clone(),
        downstream,
        cache.clone(),
        discovery,
        writer.clone(),
        options,
    ));

    tokio::spawn(writer.clone().run());
    for _ in 0..cli.concurrency.max(1) {
        tokio::spawn(run_worker(reconciler.clone(), queue.clone()));
    }
    info!(workers = cli.concurrency.max(1), "reconciler started");

    // Source loop: list compositions, reconstitute previous-then-current
    // syntheses, purge what's gone. Informer machinery lives upstream of
    // this binary; polling consumes the same interfaces.
    let mut known: HashSet<NamespacedName> = HashSet::new();
    loop {
        match upstream.list_compositions().await {
            Ok(compositions) => {
                let mut seen = HashSet::new();
                for comp in &compositions {
                    let name = comp.namespaced_name();
                    seen.insert(name.clone());
                    if let Err(e) = sync_composition(&upstream, &cache, &queue, comp).await {
                        warn!(composition = %name, error = %e, "syncing composition");
                    }
                }
                for gone in known.difference(&seen) {
                    info!(composition = %gone, "composition removed, purging cache");
                    forget_composition(&cache, gone);
                }
                known = seen;
            }
            Err(e) => warn!(error = %e, "listing compositions"),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(cli.composition_poll_interval) => {}
        }
    }

    info!("shutting down");
    queue.shut_down();
    writer.drain_once().await;
    Ok(())
}
