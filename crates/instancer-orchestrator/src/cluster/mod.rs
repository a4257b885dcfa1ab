// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Abstraction over cluster API operations for testability.
//!
//! The [`ClusterApi`] trait covers exactly what instance lifecycle
//! management needs from the orchestration substrate: create/read/delete
//! and label-based listing of workloads (Deployments) and endpoints
//! (Services), a metadata merge patch for TTL updates, and read-only pod
//! phase lookup. Gets return `Ok(None)` on 404 and deletes are idempotent,
//! so callers never branch on "already gone".

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};

use crate::error::Result;

mod kube_backend;
mod mock;

pub use kube_backend::KubeCluster;
pub use mock::MockCluster;

/// Cluster API operations needed for instance lifecycle management.
///
/// Implemented by [`KubeCluster`] for a real Kubernetes cluster and
/// [`MockCluster`] for deterministic tests and cluster-less deployments.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create the namespace if it does not exist yet.
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;

    /// Create a workload. Fails if a workload with the same name exists.
    async fn create_workload(&self, namespace: &str, workload: &Deployment) -> Result<()>;

    /// Get a workload by name. Returns `None` if it does not exist.
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Merge-patch a workload's metadata (annotations only in practice).
    async fn patch_workload_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()>;

    /// Delete a workload. Not finding it is not an error.
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;

    /// List workloads matching the given label selector.
    async fn list_workloads(&self, namespace: &str, label_selector: &str)
    -> Result<Vec<Deployment>>;

    /// Create an endpoint. Fails if an endpoint with the same name exists.
    async fn create_endpoint(&self, namespace: &str, endpoint: &Service) -> Result<()>;

    /// Get an endpoint by name. Returns `None` if it does not exist.
    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Delete an endpoint. Not finding it is not an error.
    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<()>;

    /// List endpoints matching the given label selector.
    async fn list_endpoints(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>>;

    /// List pods matching the given label selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
}
