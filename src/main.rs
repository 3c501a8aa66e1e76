//! chronoguard probe entry point.
//!
//! Runs two requests of one client against simulated clusters: the first
//! writes and shuts down with chronology protection, the second waits for
//! replicas to reach the first request's position while a background task
//! plays replication.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use chronoguard::config::{CoordinatorConfig, ShutdownMode};
use chronoguard::domain::{ClusterName, LoadBalancerFactory, RequestInfo};
use chronoguard::persistence::{MemoryTokenStore, TokenStore};
use chronoguard::service::{CommitOptions, LbCoordinator, WaitOptions};
use chronoguard::sim::{SimCluster, SimFactory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = CoordinatorConfig::from_env()?;
    tracing::info!(
        domain = %config.local_domain,
        mode = ?config.shutdown_mode,
        "starting chronoguard probe"
    );

    // Simulated topology
    let main_cluster = SimCluster::new(ClusterName::main(), &["replica-1", "replica-2"]);
    main_cluster.set_master_position(100);
    main_cluster.catch_up();
    let factory = Arc::new(SimFactory::new().with_cluster(Arc::clone(&main_cluster)));
    let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    let client = RequestInfo::new("192.0.2.1", "chronoguard-probe");

    // First request: write, commit, persist positions
    let first = LbCoordinator::new(
        config.clone(),
        Arc::clone(&factory) as Arc<dyn LoadBalancerFactory>,
        Arc::clone(&store),
        &client,
    )?;
    first.get_main_lb(None).await?;
    first.begin_master_changes("probe-write").await?;
    if let Some(lb) = factory.latest(&ClusterName::main()) {
        lb.write(Duration::from_millis(3));
    }
    first
        .commit_master_changes("probe-write", CommitOptions::default())
        .await?;
    let report = first.shutdown(config.shutdown_mode, None::<fn()>).await?;
    tracing::info!(
        positions = ?report.positions,
        persist = ?report.persist,
        "first request finished"
    );
    if let Some(time) = report.position_time {
        let url =
            first.append_pre_shutdown_time_as_query("https://example.org/after-edit", time)?;
        tracing::info!(%url, "redirect target");
    }
    first.destroy().await;

    // Replication catches up in the background
    let lagging = Arc::clone(&main_cluster);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        lagging.catch_up();
        tracing::info!(position = lagging.master_position(), "replicas caught up");
    });

    // Second request: same client, must not read before replicas catch up
    let mut second_client = client.clone();
    second_client.position_time = report.position_time;
    let second = LbCoordinator::new(
        config,
        factory as Arc<dyn LoadBalancerFactory>,
        store,
        &second_client,
    )?;
    second.get_main_lb(None).await?;
    let started = tokio::time::Instant::now();
    match second.wait_for_replication(WaitOptions::default()).await {
        Ok(()) => tracing::info!(waited = ?started.elapsed(), "second request sees its own write"),
        Err(e) => tracing::warn!(code = e.error_code(), error = %e, "replication wait failed"),
    }
    second.shutdown(ShutdownMode::NoChronologyProtection, None::<fn()>).await?;
    second.destroy().await;

    Ok(())
}
