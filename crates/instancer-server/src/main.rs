// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! instancer-server binary entry point.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use instancer_orchestrator::{
    ClusterApi, ExpirySweeper, KubeCluster, MockCluster, Orchestrator,
};
use instancer_server::challenges::{ChallengeSource, StaticChallengeSource};
use instancer_server::config::Config;
use instancer_server::coordinator::SessionCoordinator;
use instancer_server::db;
use instancer_server::routes::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("instancer_server=info,instancer_orchestrator=info")),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = db::connect(&config.database_url)
        .await
        .context("Failed to open session database")?;
    db::init(&pool).await.context("Failed to apply schema")?;

    if config.clear_sessions_on_start {
        let removed = db::clear_sessions(&pool).await?;
        tracing::info!(removed, "Cleared session table");
    }

    let challenges: Arc<dyn ChallengeSource> = match &config.challenges_file {
        Some(path) => {
            let source = StaticChallengeSource::from_file(path)
                .with_context(|| format!("Failed to load challenges from {}", path.display()))?;
            Arc::new(source)
        }
        None => {
            tracing::warn!("No challenges file configured, all challenge lookups will miss");
            Arc::new(StaticChallengeSource::empty())
        }
    };

    let cluster: Option<Arc<dyn ClusterApi>> = if config.mock_cluster {
        tracing::info!("Using in-memory mock cluster");
        Some(Arc::new(MockCluster::new()))
    } else {
        match KubeCluster::try_default().await {
            Ok(cluster) => Some(Arc::new(cluster)),
            Err(e) => {
                // Serve anyway: instance endpoints answer 503 until the
                // cluster comes back and the process restarts.
                tracing::warn!(error = %e, "Cluster client unavailable");
                None
            }
        }
    };

    let coordinator = cluster.map(|cluster| {
        let orchestrator = Arc::new(Orchestrator::new(cluster, config.orchestrator_settings()));

        if let Some(interval) = config.sweep_interval {
            let sweeper = ExpirySweeper::new(Arc::clone(&orchestrator), interval);
            tokio::spawn(async move { sweeper.run().await });
            tracing::info!(interval_seconds = interval.as_secs(), "Expiry sweeper started");
        }

        Arc::new(SessionCoordinator::new(pool.clone(), orchestrator))
    });

    let state = AppState {
        pool,
        coordinator,
        challenges,
        auth_secret: config.auth_secret.clone(),
        start_time: Instant::now(),
        version: env!("CARGO_PKG_VERSION"),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}
