// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle operations.
//!
//! The orchestrator is a stateless facade over the cluster API, keyed
//! purely by instance name and ownership labels. It knows nothing about
//! sessions; the server crate layers session coordination on top.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::cluster::ClusterApi;
use crate::error::{OrchestratorError, Result};
use crate::labels;

/// The (user, challenge) pair an instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    /// Owning user id.
    pub user_id: i64,
    /// Owning challenge id.
    pub challenge_id: i64,
}

/// Derived instance status. Never stored; computed on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Workload exists but the backing pod is not yet `Running`.
    Starting,
    /// Workload exists, pod is `Running`, expiry not reached.
    Running,
    /// Expiry timestamp passed; the instance was reaped by this read.
    Expired,
    /// Workload absent.
    Stopped,
}

impl InstanceState {
    /// Whether this state means the instance is gone (or going).
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Expired | InstanceState::Stopped)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Expired => "expired",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Response envelope from a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct StartedInstance {
    /// Generated instance name.
    pub instance_id: String,
    /// Always [`InstanceState::Starting`] right after provisioning.
    pub status: InstanceState,
    /// Container port exposed through the endpoint.
    pub port: i32,
    /// Expiry timestamp, when a TTL is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Seconds until expiry, clamped to the configured maximum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_remaining: Option<i64>,
    /// Configured maximum lifetime, when one is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_max: Option<i64>,
}

/// Observed instance status assembled from cluster state.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    /// Instance name the status was read for.
    pub instance_id: String,
    /// Derived status.
    pub status: InstanceState,
    /// Load-balancer ingress address, when provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Endpoint port, when the endpoint exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Raw phase of the backing pod, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_phase: Option<String>,
    /// Expiry timestamp, when a TTL is set on the instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Seconds until expiry; zero for expired or stopped instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_remaining: Option<i64>,
    /// Configured maximum lifetime, when one is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_max: Option<i64>,
}

/// Response envelope from a TTL extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtendOutcome {
    /// Instance the extension applied to.
    pub instance_id: String,
    /// New expiry timestamp.
    pub expires_at: i64,
    /// Seconds until the new expiry, clamped to the configured maximum.
    pub ttl_remaining: i64,
    /// Configured maximum lifetime, when one is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_max: Option<i64>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Namespace all managed resources live in.
    pub namespace: String,
    /// Base TTL for new instances. `None` means unlimited.
    pub ttl_seconds: Option<i64>,
    /// Maximum total lifetime. `None` means uncapped.
    pub ttl_max_seconds: Option<i64>,
    /// Default extend window.
    pub extend_seconds: i64,
    /// Endpoint exposure mode (`LoadBalancer` or `ClusterIP`).
    pub service_type: String,
    /// Image pull secret names referenced by workloads.
    pub image_pull_secrets: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            namespace: "per-user".to_string(),
            ttl_seconds: Some(1800),
            ttl_max_seconds: Some(3600),
            extend_seconds: 300,
            service_type: "LoadBalancer".to_string(),
            image_pull_secrets: Vec::new(),
        }
    }
}

/// Stateless instance lifecycle manager over an injected cluster client.
pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Create an orchestrator using the wall clock.
    pub fn new(cluster: Arc<dyn ClusterApi>, settings: OrchestratorSettings) -> Self {
        Self::with_clock(cluster, settings, Arc::new(SystemClock))
    }

    /// Create an orchestrator with an explicit clock (tests).
    pub fn with_clock(
        cluster: Arc<dyn ClusterApi>,
        settings: OrchestratorSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cluster,
            clock,
            settings,
        }
    }

    /// The settings this orchestrator was built with.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    fn ttl_max(&self) -> Option<i64> {
        self.settings.ttl_max_seconds
    }

    /// Initial TTL for a new instance: base TTL capped by the maximum.
    fn initial_ttl(&self) -> Option<i64> {
        match (self.settings.ttl_seconds, self.ttl_max()) {
            (Some(ttl), Some(max)) => Some(ttl.min(max)),
            (ttl, _) => ttl,
        }
    }

    fn clamp_remaining(&self, remaining: i64) -> i64 {
        let remaining = remaining.max(0);
        match self.ttl_max() {
            Some(max) => remaining.min(max),
            None => remaining,
        }
    }

    /// Provision a workload/endpoint pair for an owner.
    ///
    /// No automatic rollback: if the endpoint create fails after the
    /// workload create succeeded, the orphaned workload stays behind and
    /// the error surfaces. Owner-wide stop and the expiry sweep both pick
    /// such orphans up later.
    pub async fn start_instance(
        &self,
        owner: &Owner,
        image: &str,
        tag: Option<&str>,
        port: i32,
    ) -> Result<StartedInstance> {
        self.cluster.ensure_namespace(self.namespace()).await?;

        let name = labels::instance_name(owner);
        let full_image = match tag {
            Some(tag) => format!("{image}:{tag}"),
            None => image.to_string(),
        };
        let now = self.clock.now_unix();
        let ttl = self.initial_ttl();

        let resource_labels = labels::instance_labels(owner, &name);
        let mut annotations = serde_json::Map::new();
        annotations.insert(labels::CREATED_AT_ANNOTATION.into(), json!(now.to_string()));
        annotations.insert(labels::LAST_SEEN_ANNOTATION.into(), json!(now.to_string()));
        if let Some(ttl) = ttl {
            annotations.insert(
                labels::EXPIRES_AT_ANNOTATION.into(),
                json!((now + ttl).to_string()),
            );
        }

        let pull_secrets: Vec<serde_json::Value> = self
            .settings
            .image_pull_secrets
            .iter()
            .map(|n| json!({ "name": n }))
            .collect();

        let workload: Deployment = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": &name,
                "labels": &resource_labels,
                "annotations": annotations,
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { "app": &name } },
                "template": {
                    "metadata": { "labels": &resource_labels },
                    "spec": {
                        "imagePullSecrets": pull_secrets,
                        "containers": [{
                            "name": "instance",
                            "image": &full_image,
                            "ports": [{ "containerPort": port }],
                        }],
                    },
                },
            },
        }))?;

        let endpoint: Service = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": &name,
                "labels": &resource_labels,
            },
            "spec": {
                "type": &self.settings.service_type,
                "selector": { "app": &name },
                "ports": [{ "port": port, "targetPort": port }],
            },
        }))?;

        self.cluster
            .create_workload(self.namespace(), &workload)
            .await?;
        self.cluster
            .create_endpoint(self.namespace(), &endpoint)
            .await?;

        info!(
            instance_id = %name,
            user_id = owner.user_id,
            challenge_id = owner.challenge_id,
            image = %full_image,
            port,
            ttl = ?ttl,
            "Instance provisioned"
        );

        Ok(StartedInstance {
            instance_id: name,
            status: InstanceState::Starting,
            port,
            expires_at: ttl.map(|t| now + t),
            ttl_remaining: ttl.map(|t| self.clamp_remaining(t)),
            ttl_max: ttl.and(self.ttl_max()),
        })
    }

    /// Observe an instance, reaping it if its expiry has passed.
    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let Some(workload) = self.cluster.get_workload(self.namespace(), instance_id).await? else {
            return Ok(InstanceStatus {
                instance_id: instance_id.to_string(),
                status: InstanceState::Stopped,
                ip: None,
                port: None,
                pod_phase: None,
                expires_at: None,
                ttl_remaining: Some(0),
                ttl_max: None,
            });
        };

        let now = self.clock.now_unix();
        let expires_at = labels::annotation_i64(&workload.metadata, labels::EXPIRES_AT_ANNOTATION);

        if let Some(expires_at) = expires_at
            && now >= expires_at
        {
            // Lazy reap: expiry is enforced at the next observation.
            info!(instance_id, expires_at, now, "Instance expired, reaping");
            self.stop_instance(instance_id).await?;
            return Ok(InstanceStatus {
                instance_id: instance_id.to_string(),
                status: InstanceState::Expired,
                ip: None,
                port: None,
                pod_phase: None,
                expires_at: Some(expires_at),
                ttl_remaining: Some(0),
                ttl_max: None,
            });
        }

        let endpoint = self.cluster.get_endpoint(self.namespace(), instance_id).await?;
        let pods = self
            .cluster
            .list_pods(self.namespace(), &labels::app_selector(instance_id))
            .await?;

        let ip = endpoint.as_ref().and_then(|svc| {
            svc.status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|ingress| ingress.first())
                .and_then(|i| i.ip.clone())
        });
        let port = endpoint.as_ref().and_then(|svc| {
            svc.spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|ports| ports.first())
                .map(|p| p.port)
        });
        let pod_phase = pods
            .first()
            .and_then(|pod| pod.status.as_ref())
            .and_then(|s| s.phase.clone());

        let status = if pod_phase.as_deref() == Some("Running") {
            InstanceState::Running
        } else {
            InstanceState::Starting
        };

        Ok(InstanceStatus {
            instance_id: instance_id.to_string(),
            status,
            ip,
            port,
            pod_phase,
            expires_at,
            ttl_remaining: expires_at.map(|e| self.clamp_remaining(e - now)),
            ttl_max: expires_at.and(self.ttl_max()),
        })
    }

    /// Push an instance's expiry out by `extend_by` seconds (default: the
    /// configured extend window), never past `created_at + ttl_max`.
    ///
    /// Patches only the timestamp annotations; replicas and image are
    /// untouched.
    pub async fn extend_instance(
        &self,
        instance_id: &str,
        extend_by: Option<i64>,
    ) -> Result<ExtendOutcome> {
        let workload = self
            .cluster
            .get_workload(self.namespace(), instance_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(instance_id.to_string()))?;

        let now = self.clock.now_unix();
        let extend_by = extend_by.unwrap_or(self.settings.extend_seconds);
        let created_at =
            labels::annotation_i64(&workload.metadata, labels::CREATED_AT_ANNOTATION)
                .unwrap_or(now);
        let current_expires =
            labels::annotation_i64(&workload.metadata, labels::EXPIRES_AT_ANNOTATION)
                .unwrap_or(now);

        let base = current_expires.max(now);
        let mut new_expires = base + extend_by;
        if let Some(max) = self.ttl_max() {
            new_expires = new_expires.min(created_at + max);
        }

        let mut annotations = serde_json::Map::new();
        annotations.insert(labels::LAST_SEEN_ANNOTATION.into(), json!(now.to_string()));
        annotations.insert(
            labels::EXPIRES_AT_ANNOTATION.into(),
            json!(new_expires.to_string()),
        );
        self.cluster
            .patch_workload_metadata(
                self.namespace(),
                instance_id,
                json!({ "metadata": { "annotations": annotations } }),
            )
            .await?;

        info!(instance_id, new_expires, extend_by, "Instance extended");

        Ok(ExtendOutcome {
            instance_id: instance_id.to_string(),
            expires_at: new_expires,
            ttl_remaining: self.clamp_remaining(new_expires - now),
            ttl_max: self.ttl_max(),
        })
    }

    /// Delete an instance's workload and endpoint. Idempotent: resources
    /// that are already gone are not an error. Both deletions are always
    /// attempted; the first failure is reported after.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let workload_result = self.cluster.delete_workload(self.namespace(), instance_id).await;
        let endpoint_result = self.cluster.delete_endpoint(self.namespace(), instance_id).await;
        workload_result?;
        endpoint_result?;
        info!(instance_id, "Instance stopped");
        Ok(())
    }

    /// Delete every instance belonging to an owner. Individual failures
    /// are logged and swallowed so cleanup is maximally thorough.
    pub async fn stop_instances_for_owner(&self, owner: &Owner) -> Result<()> {
        let selector = labels::owner_selector(owner);

        match self.cluster.list_workloads(self.namespace(), &selector).await {
            Ok(workloads) => {
                for workload in workloads {
                    if let Some(name) = workload.metadata.name.as_deref()
                        && let Err(e) = self.cluster.delete_workload(self.namespace(), name).await
                    {
                        warn!(instance_id = name, error = %e, "Failed to delete workload during owner cleanup");
                    }
                }
            }
            Err(e) => warn!(
                user_id = owner.user_id,
                challenge_id = owner.challenge_id,
                error = %e,
                "Failed to list workloads during owner cleanup"
            ),
        }

        match self.cluster.list_endpoints(self.namespace(), &selector).await {
            Ok(endpoints) => {
                for endpoint in endpoints {
                    if let Some(name) = endpoint.metadata.name.as_deref()
                        && let Err(e) = self.cluster.delete_endpoint(self.namespace(), name).await
                    {
                        warn!(endpoint = name, error = %e, "Failed to delete endpoint during owner cleanup");
                    }
                }
            }
            Err(e) => warn!(
                user_id = owner.user_id,
                challenge_id = owner.challenge_id,
                error = %e,
                "Failed to list endpoints during owner cleanup"
            ),
        }

        Ok(())
    }

    /// Find the most recently created live instance for an owner, if any.
    ///
    /// Fallback for when the local session record is missing but a
    /// cluster-side instance might still exist (e.g. after a restart).
    pub async fn find_existing_instance(&self, owner: &Owner) -> Result<Option<String>> {
        let workloads = self
            .cluster
            .list_workloads(self.namespace(), &labels::owner_selector(owner))
            .await?;

        Ok(workloads
            .into_iter()
            .max_by_key(|w| {
                labels::annotation_i64(&w.metadata, labels::CREATED_AT_ANNOTATION).unwrap_or(0)
            })
            .and_then(|w| w.metadata.name))
    }

    /// Names of every managed workload, newest first not guaranteed.
    /// Used by the expiry sweeper.
    pub async fn managed_instances(&self) -> Result<Vec<String>> {
        let workloads = self
            .cluster
            .list_workloads(self.namespace(), &labels::component_selector())
            .await?;
        Ok(workloads
            .into_iter()
            .filter_map(|w| w.metadata.name)
            .collect())
    }
}
