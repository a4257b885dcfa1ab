// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session coordinator behavior over the in-memory cluster.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};

use instancer_orchestrator::{
    ClusterApi, InstanceState, ManualClock, MockCluster, Orchestrator, OrchestratorSettings,
    Result as ClusterResult,
};
use instancer_server::challenges::ChallengeConfig;
use instancer_server::coordinator::{
    STATUS_ALREADY_RUNNING, STATUS_STARTING, STATUS_STOPPED_EXISTING, SessionCoordinator,
    StatusTarget,
};
use instancer_server::db;
use instancer_server::error::ApiError;

async fn test_pool() -> Pool<Sqlite> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init(&pool).await.unwrap();
    pool
}

async fn coordinator_at(
    now: i64,
) -> (
    Arc<SessionCoordinator>,
    Arc<MockCluster>,
    Arc<ManualClock>,
    Pool<Sqlite>,
) {
    let cluster = Arc::new(MockCluster::new());
    let clock = Arc::new(ManualClock::new(now));
    let orchestrator = Arc::new(Orchestrator::with_clock(
        cluster.clone(),
        OrchestratorSettings::default(),
        clock.clone(),
    ));
    let pool = test_pool().await;
    let coordinator = Arc::new(SessionCoordinator::new(pool.clone(), orchestrator));
    (coordinator, cluster, clock, pool)
}

fn web_challenge() -> ChallengeConfig {
    ChallengeConfig {
        image: "ctf/web".to_string(),
        tag: Some("v1".to_string()),
        port: Some(8080),
    }
}

#[tokio::test]
async fn concurrent_starts_provision_exactly_once() {
    let (coordinator, cluster, _clock, pool) = coordinator_at(1_000).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.start(1, 7, &web_challenge()).await })
        })
        .collect();

    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert!(
            response.status == STATUS_STARTING || response.status == STATUS_ALREADY_RUNNING,
            "unexpected status {}",
            response.status
        );
    }

    assert_eq!(cluster.create_calls(), 1);
    let row = db::get_session(&pool, 1, 7).await.unwrap().unwrap();
    assert!(row.instance_id.starts_with("ctf-u1-c7-"));
}

#[tokio::test]
async fn second_start_reports_already_running() {
    let (coordinator, cluster, _clock, _pool) = coordinator_at(1_000).await;

    let first = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(first.status, STATUS_STARTING);
    let instance_id = first.instance_id.unwrap();

    let second = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(second.status, STATUS_ALREADY_RUNNING);
    assert_eq!(second.instance_id.as_deref(), Some(instance_id.as_str()));
    assert_eq!(cluster.create_calls(), 1);
}

#[tokio::test]
async fn start_after_expiry_reprovisions() {
    let (coordinator, cluster, clock, _pool) = coordinator_at(1_000).await;

    let first = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    let first_id = first.instance_id.unwrap();

    // Default TTL is 1800s; step well past it.
    clock.advance(5_000);

    let second = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(second.status, STATUS_STARTING);
    assert_ne!(second.instance_id.as_deref(), Some(first_id.as_str()));
    assert_eq!(cluster.create_calls(), 2);
}

#[tokio::test]
async fn status_of_terminal_instance_clears_session() {
    let (coordinator, _cluster, _clock, pool) = coordinator_at(1_000).await;

    let started = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    let instance_id = started.instance_id.unwrap();

    // Tear down behind the coordinator's back.
    coordinator
        .orchestrator()
        .stop_instance(&instance_id)
        .await
        .unwrap();

    let status = coordinator
        .status(1, StatusTarget::Challenge(7))
        .await
        .unwrap();
    assert_eq!(status.status, InstanceState::Stopped);
    assert!(db::get_session(&pool, 1, 7).await.unwrap().is_none());
}

#[tokio::test]
async fn half_started_duplicate_is_stopped() {
    let (coordinator, cluster, _clock, pool) = coordinator_at(1_000).await;

    cluster.set_pod_phase("Pending").await;
    let first = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    let first_id = first.instance_id.unwrap();

    let second = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(second.status, STATUS_STOPPED_EXISTING);
    assert_eq!(second.instance_id.as_deref(), Some(first_id.as_str()));
    assert!(db::get_session(&pool, 1, 7).await.unwrap().is_none());

    // Slot freed, a fresh start provisions again.
    let third = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(third.status, STATUS_STARTING);
    assert_eq!(cluster.create_calls(), 2);
}

#[tokio::test]
async fn cluster_instance_is_adopted_after_row_loss() {
    let (coordinator, cluster, _clock, pool) = coordinator_at(1_000).await;

    let started = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    let instance_id = started.instance_id.unwrap();

    // Simulate losing the session table.
    db::clear_sessions(&pool).await.unwrap();

    let response = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(response.status, STATUS_ALREADY_RUNNING);
    assert_eq!(response.instance_id.as_deref(), Some(instance_id.as_str()));
    assert_eq!(cluster.create_calls(), 1);

    let row = db::get_session(&pool, 1, 7).await.unwrap().unwrap();
    assert_eq!(row.instance_id, instance_id);
}

#[tokio::test]
async fn status_by_challenge_falls_back_to_cluster_lookup() {
    let (coordinator, _cluster, _clock, pool) = coordinator_at(1_000).await;

    let started = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    let instance_id = started.instance_id.unwrap();
    db::clear_sessions(&pool).await.unwrap();

    let status = coordinator
        .status(1, StatusTarget::Challenge(7))
        .await
        .unwrap();
    assert_eq!(status.instance_id, instance_id);
    assert_eq!(status.status, InstanceState::Running);
}

#[tokio::test]
async fn stop_without_session_is_ok() {
    let (coordinator, _cluster, _clock, _pool) = coordinator_at(1_000).await;

    coordinator.stop(1, None, Some(7)).await.unwrap();
}

#[tokio::test]
async fn stop_by_instance_id_clears_matching_row() {
    let (coordinator, cluster, _clock, pool) = coordinator_at(1_000).await;

    let started = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    let instance_id = started.instance_id.unwrap();

    coordinator
        .stop(1, Some(instance_id.clone()), None)
        .await
        .unwrap();

    assert!(db::get_session(&pool, 1, 7).await.unwrap().is_none());
    assert!(cluster.workload_names().await.is_empty());
}

#[tokio::test]
async fn stop_without_any_target_is_a_validation_error() {
    let (coordinator, _cluster, _clock, _pool) = coordinator_at(1_000).await;

    let err = coordinator.stop(1, None, None).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));
}

#[tokio::test]
async fn extend_without_target_is_a_validation_error() {
    let (coordinator, _cluster, _clock, _pool) = coordinator_at(1_000).await;

    let err = coordinator.extend(1, None, None, None).await.unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));
}

#[tokio::test]
async fn extend_by_challenge_resolves_session_instance() {
    let (coordinator, _cluster, clock, _pool) = coordinator_at(1_000).await;

    let started = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    let expires_at = started.expires_at.unwrap();

    clock.advance(100);
    let outcome = coordinator.extend(1, None, Some(7), Some(200)).await.unwrap();
    assert_eq!(outcome.expires_at, expires_at + 200);
}

/// Cluster fake whose workload create clears the session table first,
/// standing in for an owner-wide stop landing mid-provision.
struct StopRacingCluster {
    inner: MockCluster,
    pool: Pool<Sqlite>,
}

#[async_trait]
impl ClusterApi for StopRacingCluster {
    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<()> {
        self.inner.ensure_namespace(namespace).await
    }

    async fn create_workload(
        &self,
        namespace: &str,
        workload: &Deployment,
    ) -> ClusterResult<()> {
        db::clear_sessions(&self.pool).await.ok();
        self.inner.create_workload(namespace, workload).await
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Deployment>> {
        self.inner.get_workload(namespace, name).await
    }

    async fn patch_workload_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> ClusterResult<()> {
        self.inner.patch_workload_metadata(namespace, name, patch).await
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.inner.delete_workload(namespace, name).await
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> ClusterResult<Vec<Deployment>> {
        self.inner.list_workloads(namespace, label_selector).await
    }

    async fn create_endpoint(&self, namespace: &str, endpoint: &Service) -> ClusterResult<()> {
        self.inner.create_endpoint(namespace, endpoint).await
    }

    async fn get_endpoint(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<Option<Service>> {
        self.inner.get_endpoint(namespace, name).await
    }

    async fn delete_endpoint(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.inner.delete_endpoint(namespace, name).await
    }

    async fn list_endpoints(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> ClusterResult<Vec<Service>> {
        self.inner.list_endpoints(namespace, label_selector).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> ClusterResult<Vec<Pod>> {
        self.inner.list_pods(namespace, label_selector).await
    }
}

#[tokio::test]
async fn slot_removed_during_provisioning_stops_the_fresh_instance() {
    let pool = test_pool().await;
    let cluster = Arc::new(StopRacingCluster {
        inner: MockCluster::new(),
        pool: pool.clone(),
    });
    let orchestrator = Arc::new(Orchestrator::new(
        cluster.clone(),
        OrchestratorSettings::default(),
    ));
    let coordinator = SessionCoordinator::new(pool.clone(), orchestrator);

    let response = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(response.status, STATUS_STOPPED_EXISTING);

    // Nothing left behind on either side.
    assert!(db::get_session(&pool, 1, 7).await.unwrap().is_none());
    assert!(cluster.inner.workload_names().await.is_empty());
}

#[tokio::test]
async fn provisioning_failure_releases_the_slot() {
    let (coordinator, cluster, _clock, pool) = coordinator_at(1_000).await;

    cluster.fail_workload_creates(true).await;
    let err = coordinator.start(1, 7, &web_challenge()).await.unwrap_err();
    assert!(matches!(err, ApiError::Provisioning(_)));
    assert!(db::get_session(&pool, 1, 7).await.unwrap().is_none());

    cluster.fail_workload_creates(false).await;
    let retry = coordinator.start(1, 7, &web_challenge()).await.unwrap();
    assert_eq!(retry.status, STATUS_STARTING);
}
