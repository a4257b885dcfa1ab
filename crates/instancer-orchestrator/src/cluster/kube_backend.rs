// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Real Kubernetes backend using kube-rs.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};

use super::ClusterApi;
use crate::error::{OrchestratorError, Result};

/// Real cluster backend using the kube-rs client.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// Create a new KubeCluster from an existing client.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Create a new KubeCluster using the in-cluster or kubeconfig
    /// configuration, whichever applies.
    pub async fn try_default() -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| OrchestratorError::ClientUnavailable(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn workloads(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn endpoints(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn provisioning(e: kube::Error) -> OrchestratorError {
    OrchestratorError::Provisioning(e.to_string())
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.get(namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let body = Namespace {
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                namespaces
                    .create(&PostParams::default(), &body)
                    .await
                    .map_err(provisioning)?;
                Ok(())
            }
            Err(e) => Err(provisioning(e)),
        }
    }

    async fn create_workload(&self, namespace: &str, workload: &Deployment) -> Result<()> {
        self.workloads(namespace)
            .create(&PostParams::default(), workload)
            .await
            .map_err(provisioning)?;
        Ok(())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        match self.workloads(namespace).get(name).await {
            Ok(w) => Ok(Some(w)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(provisioning(e)),
        }
    }

    async fn patch_workload_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        match self
            .workloads(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(OrchestratorError::NotFound(name.to_string()))
            }
            Err(e) => Err(provisioning(e)),
        }
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .workloads(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()), // Already deleted
            Err(e) => Err(provisioning(e)),
        }
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Deployment>> {
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .workloads(namespace)
            .list(&lp)
            .await
            .map_err(provisioning)?;
        Ok(list.items)
    }

    async fn create_endpoint(&self, namespace: &str, endpoint: &Service) -> Result<()> {
        self.endpoints(namespace)
            .create(&PostParams::default(), endpoint)
            .await
            .map_err(provisioning)?;
        Ok(())
    }

    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        match self.endpoints(namespace).get(name).await {
            Ok(s) => Ok(Some(s)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(provisioning(e)),
        }
    }

    async fn delete_endpoint(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .endpoints(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()), // Already deleted
            Err(e) => Err(provisioning(e)),
        }
    }

    async fn list_endpoints(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>> {
        let lp = ListParams::default().labels(label_selector);
        let list = self
            .endpoints(namespace)
            .list(&lp)
            .await
            .map_err(provisioning)?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        let list = pods.list(&lp).await.map_err(provisioning)?;
        Ok(list.items)
    }
}
