// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cluster fake for tests and cluster-less deployments.
//!
//! Behaves like the real backend in shape: gets return `None` on absence,
//! deletes are idempotent, lists filter by label selector. Values are
//! synthetic: every instance gets a fixed load-balancer IP and a single
//! backing pod whose phase is controlled by the test.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Pod, PodStatus, Service, ServiceStatus,
};
use tokio::sync::Mutex;

use super::ClusterApi;
use crate::error::{OrchestratorError, Result};
use crate::labels::APP_LABEL;

/// Synthetic ingress IP reported for every mock endpoint.
pub const MOCK_INGRESS_IP: &str = "203.0.113.10";

#[derive(Debug, Default)]
struct MockState {
    namespaces: HashSet<String>,
    workloads: HashMap<String, Deployment>,
    endpoints: HashMap<String, Service>,
    pod_phase: Option<String>,
    fail_workload_creates: bool,
    fail_endpoint_creates: bool,
}

/// Deterministic in-memory cluster fake.
pub struct MockCluster {
    state: Mutex<MockState>,
    create_calls: AtomicUsize,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Create an empty mock cluster whose pods report phase `Running`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Number of workload create calls issued so far.
    ///
    /// Used to verify that concurrent start requests provision at most once.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Override the phase reported for backing pods (default `Running`).
    pub async fn set_pod_phase(&self, phase: &str) {
        self.state.lock().await.pod_phase = Some(phase.to_string());
    }

    /// Make subsequent workload creates fail.
    pub async fn fail_workload_creates(&self, fail: bool) {
        self.state.lock().await.fail_workload_creates = fail;
    }

    /// Make subsequent endpoint creates fail, leaving the workload behind.
    pub async fn fail_endpoint_creates(&self, fail: bool) {
        self.state.lock().await.fail_endpoint_creates = fail;
    }

    /// Names of all live workloads, for test assertions.
    pub async fn workload_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.workloads.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Match resource labels against a `k=v,k2=v2` selector string.
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector
        .split(',')
        .filter(|clause| !clause.is_empty())
        .all(|clause| match clause.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
            None => false,
        })
}

fn workload_matches(workload: &Deployment, selector: &str) -> bool {
    matches_selector(workload.metadata.labels.as_ref(), selector)
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .namespaces
            .insert(namespace.to_string());
        Ok(())
    }

    async fn create_workload(&self, _namespace: &str, workload: &Deployment) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.fail_workload_creates {
            return Err(OrchestratorError::Provisioning(
                "mock workload create failure".to_string(),
            ));
        }
        let name = workload.metadata.name.clone().unwrap_or_default();
        if state.workloads.contains_key(&name) {
            return Err(OrchestratorError::Provisioning(format!(
                "workload {name} already exists"
            )));
        }
        state.workloads.insert(name, workload.clone());
        Ok(())
    }

    async fn get_workload(&self, _namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.state.lock().await.workloads.get(name).cloned())
    }

    async fn patch_workload_metadata(
        &self,
        _namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(workload) = state.workloads.get_mut(name) else {
            return Err(OrchestratorError::NotFound(name.to_string()));
        };
        // Merge-patch semantics for the only path we use: metadata.annotations.
        if let Some(patched) = patch
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.as_object())
        {
            let annotations = workload.metadata.annotations.get_or_insert_with(Default::default);
            for (key, value) in patched {
                if let Some(value) = value.as_str() {
                    annotations.insert(key.clone(), value.to_string());
                }
            }
        }
        Ok(())
    }

    async fn delete_workload(&self, _namespace: &str, name: &str) -> Result<()> {
        self.state.lock().await.workloads.remove(name);
        Ok(())
    }

    async fn list_workloads(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Deployment>> {
        Ok(self
            .state
            .lock()
            .await
            .workloads
            .values()
            .filter(|w| workload_matches(w, label_selector))
            .cloned()
            .collect())
    }

    async fn create_endpoint(&self, _namespace: &str, endpoint: &Service) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_endpoint_creates {
            return Err(OrchestratorError::Provisioning(
                "mock endpoint create failure".to_string(),
            ));
        }
        let name = endpoint.metadata.name.clone().unwrap_or_default();
        if state.endpoints.contains_key(&name) {
            return Err(OrchestratorError::Provisioning(format!(
                "endpoint {name} already exists"
            )));
        }
        state.endpoints.insert(name, endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(&self, _namespace: &str, name: &str) -> Result<Option<Service>> {
        let state = self.state.lock().await;
        Ok(state.endpoints.get(name).cloned().map(|mut svc| {
            // Synthesize a provisioned load balancer.
            svc.status = Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(MOCK_INGRESS_IP.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            });
            svc
        }))
    }

    async fn delete_endpoint(&self, _namespace: &str, name: &str) -> Result<()> {
        self.state.lock().await.endpoints.remove(name);
        Ok(())
    }

    async fn list_endpoints(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Service>> {
        Ok(self
            .state
            .lock()
            .await
            .endpoints
            .values()
            .filter(|s| matches_selector(s.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let state = self.state.lock().await;
        let phase = state
            .pod_phase
            .clone()
            .unwrap_or_else(|| "Running".to_string());
        // One synthetic pod per workload whose app label matches.
        let pods = state
            .workloads
            .values()
            .filter(|w| {
                workload_matches(w, label_selector)
                    || label_selector
                        .split_once('=')
                        .is_some_and(|(k, v)| {
                            k == APP_LABEL
                                && w.metadata.name.as_deref() == Some(v)
                        })
            })
            .map(|_| Pod {
                status: Some(PodStatus {
                    phase: Some(phase.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        Ok(pods)
    }
}
