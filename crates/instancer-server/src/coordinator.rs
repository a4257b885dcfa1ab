// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-user session coordination.
//!
//! The session table's `UNIQUE (user_id, challenge_id)` constraint is
//! the only serialization point: concurrent starts race on the row
//! insert, exactly one wins, and the winner provisions. While the
//! winner is still talking to the cluster the row holds a `pending-`
//! lock token instead of a real instance name, so every other caller
//! can tell "being provisioned" from "running".

use std::sync::Arc;

use serde::Serialize;
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use instancer_orchestrator::{
    ExtendOutcome, InstanceState, InstanceStatus, Orchestrator, Owner,
};

use crate::challenges::ChallengeConfig;
use crate::db;
use crate::error::{ApiError, Result};

/// Outcome of a start request.
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    /// Coordinator-level status: `starting`, `already-running`, or
    /// `stopped_existing`.
    pub status: String,
    /// Instance name, once one is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Exposed container port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Expiry timestamp when a TTL applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Seconds left until expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_remaining: Option<i64>,
    /// Configured maximum lifetime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_max: Option<i64>,
}

/// Provisioning has started (or is already in flight elsewhere).
pub const STATUS_STARTING: &str = "starting";
/// A live instance already serves this (user, challenge) pair.
pub const STATUS_ALREADY_RUNNING: &str = "already-running";
/// A half-started duplicate was torn down; the caller should retry.
pub const STATUS_STOPPED_EXISTING: &str = "stopped_existing";

/// Container port used when a challenge does not name one.
const DEFAULT_CONTAINER_PORT: i32 = 80;

/// What a status request is asked about.
#[derive(Debug, Clone)]
pub enum StatusTarget {
    /// A concrete instance name.
    Instance(String),
    /// Whatever instance serves this challenge for the caller.
    Challenge(i64),
}

/// Coordinates session rows and orchestrator calls per user.
pub struct SessionCoordinator {
    pool: Pool<Sqlite>,
    orchestrator: Arc<Orchestrator>,
}

fn lock_token() -> String {
    format!("pending-{}", Uuid::new_v4().simple())
}

fn is_lock_token(instance_id: &str) -> bool {
    instance_id.starts_with("pending-")
}

fn starting_response() -> StartResponse {
    StartResponse {
        status: STATUS_STARTING.to_string(),
        instance_id: None,
        port: None,
        expires_at: None,
        ttl_remaining: None,
        ttl_max: None,
    }
}

fn stopped_existing_response(instance_id: String) -> StartResponse {
    StartResponse {
        status: STATUS_STOPPED_EXISTING.to_string(),
        instance_id: Some(instance_id),
        port: None,
        expires_at: None,
        ttl_remaining: None,
        ttl_max: None,
    }
}

fn running_response(status: InstanceStatus) -> StartResponse {
    StartResponse {
        status: STATUS_ALREADY_RUNNING.to_string(),
        instance_id: Some(status.instance_id),
        port: status.port,
        expires_at: status.expires_at,
        ttl_remaining: status.ttl_remaining,
        ttl_max: status.ttl_max,
    }
}

impl SessionCoordinator {
    /// Create a coordinator over a session pool and an orchestrator.
    pub fn new(pool: Pool<Sqlite>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { pool, orchestrator }
    }

    /// The underlying orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Start (or report) the caller's instance for a challenge.
    pub async fn start(
        &self,
        user_id: i64,
        challenge_id: i64,
        challenge: &ChallengeConfig,
    ) -> Result<StartResponse> {
        let owner = Owner {
            user_id,
            challenge_id,
        };

        // Phase 1: inspect the existing session row, if any.
        if let Some(row) = db::get_session(&self.pool, user_id, challenge_id).await? {
            if is_lock_token(&row.instance_id) {
                // Another request holds the provisioning lock.
                return Ok(starting_response());
            }

            let status = self.orchestrator.status(&row.instance_id).await?;
            match status.status {
                InstanceState::Running => return Ok(running_response(status)),
                InstanceState::Starting => {
                    // A half-started instance blocks the slot. Clear it
                    // and let the caller issue a fresh start.
                    tracing::info!(
                        user_id,
                        challenge_id,
                        instance_id = %row.instance_id,
                        "Stopping half-started instance"
                    );
                    self.orchestrator.stop_instance(&row.instance_id).await?;
                    db::delete_session(&self.pool, user_id, challenge_id).await?;
                    return Ok(stopped_existing_response(row.instance_id));
                }
                InstanceState::Expired | InstanceState::Stopped => {
                    // Stale row for a dead instance; reclaim the slot.
                    db::delete_session(&self.pool, user_id, challenge_id).await?;
                }
            }
        } else if let Some(existing) = self.orchestrator.find_existing_instance(&owner).await? {
            // No row, but the cluster has an instance for this owner
            // (session table lost or cleared). Adopt or tear down.
            let status = self.orchestrator.status(&existing).await?;
            match status.status {
                InstanceState::Running => {
                    db::try_insert_session(
                        &self.pool,
                        user_id,
                        challenge_id,
                        &existing,
                        self.now(),
                    )
                    .await?;
                    return Ok(running_response(status));
                }
                InstanceState::Starting => {
                    self.orchestrator.stop_instance(&existing).await?;
                    return Ok(stopped_existing_response(existing));
                }
                InstanceState::Expired | InstanceState::Stopped => {}
            }
        }

        // Phase 2: race for the slot via the unique constraint.
        let token = lock_token();
        let won = db::try_insert_session(&self.pool, user_id, challenge_id, &token, self.now())
            .await?;

        if !won {
            // Someone else inserted between our read and write. Read
            // again and report what they are doing.
            return match db::get_session(&self.pool, user_id, challenge_id).await? {
                Some(row) if is_lock_token(&row.instance_id) => Ok(starting_response()),
                Some(row) => {
                    let status = self.orchestrator.status(&row.instance_id).await?;
                    if status.status == InstanceState::Running {
                        Ok(running_response(status))
                    } else {
                        // Winner's instance is already starting or gone
                        // again; from this caller's view it is in flight.
                        Ok(starting_response())
                    }
                }
                // Row vanished between the insert and the re-read.
                None => Ok(starting_response()),
            };
        }

        // Phase 3: we hold the lock, provision.
        let started = match self
            .orchestrator
            .start_instance(
                &owner,
                &challenge.image,
                challenge.tag.as_deref(),
                challenge.port.unwrap_or(DEFAULT_CONTAINER_PORT),
            )
            .await
        {
            Ok(started) => started,
            Err(e) => {
                // Release the slot so a retry is not wedged behind a
                // dangling lock token.
                db::delete_session(&self.pool, user_id, challenge_id).await?;
                return Err(e.into());
            }
        };

        let updated = db::update_session_instance(
            &self.pool,
            user_id,
            challenge_id,
            &started.instance_id,
            self.now(),
        )
        .await?;

        if !updated {
            // A concurrent stop removed the slot while provisioning was
            // in flight. Tear the fresh instance down rather than leave
            // it running with no session row.
            tracing::info!(
                user_id,
                challenge_id,
                instance_id = %started.instance_id,
                "Session removed during provisioning, stopping instance"
            );
            self.orchestrator.stop_instance(&started.instance_id).await?;
            return Ok(stopped_existing_response(started.instance_id));
        }

        Ok(StartResponse {
            status: STATUS_STARTING.to_string(),
            instance_id: Some(started.instance_id),
            port: Some(started.port),
            expires_at: started.expires_at,
            ttl_remaining: started.ttl_remaining,
            ttl_max: started.ttl_max,
        })
    }

    /// Report the status of an instance or of the caller's instance
    /// for a challenge. Clears the session row when the instance turns
    /// out to be gone.
    pub async fn status(&self, user_id: i64, target: StatusTarget) -> Result<InstanceStatus> {
        let (instance_id, challenge_id) = match target {
            StatusTarget::Instance(id) => (Some(id), None),
            StatusTarget::Challenge(challenge_id) => {
                match db::get_session(&self.pool, user_id, challenge_id).await? {
                    Some(row) if is_lock_token(&row.instance_id) => {
                        return Ok(InstanceStatus {
                            instance_id: row.instance_id,
                            status: InstanceState::Starting,
                            ip: None,
                            port: None,
                            pod_phase: None,
                            expires_at: None,
                            ttl_remaining: None,
                            ttl_max: None,
                        });
                    }
                    Some(row) => (Some(row.instance_id), Some(challenge_id)),
                    None => {
                        let owner = Owner {
                            user_id,
                            challenge_id,
                        };
                        (
                            self.orchestrator.find_existing_instance(&owner).await?,
                            Some(challenge_id),
                        )
                    }
                }
            }
        };

        let Some(instance_id) = instance_id else {
            return Ok(InstanceStatus {
                instance_id: String::new(),
                status: InstanceState::Stopped,
                ip: None,
                port: None,
                pod_phase: None,
                expires_at: None,
                ttl_remaining: Some(0),
                ttl_max: None,
            });
        };

        let status = self.orchestrator.status(&instance_id).await?;

        if status.status.is_terminal() {
            match challenge_id {
                Some(challenge_id) => {
                    db::delete_session(&self.pool, user_id, challenge_id).await?;
                }
                None => {
                    db::delete_session_by_instance(&self.pool, user_id, &instance_id).await?;
                }
            }
        }

        Ok(status)
    }

    /// Stop an instance, identified either directly or by challenge.
    pub async fn stop(
        &self,
        user_id: i64,
        instance_id: Option<String>,
        mut challenge_id: Option<i64>,
    ) -> Result<()> {
        let resolved = match (&instance_id, challenge_id) {
            (Some(id), _) => {
                // Learn the challenge from the session row when the caller
                // only named the instance, so owner-wide cleanup still runs.
                if challenge_id.is_none() {
                    challenge_id = db::get_session_by_instance(&self.pool, user_id, id)
                        .await?
                        .map(|row| row.challenge_id);
                }
                Some(id.clone())
            }
            (None, Some(challenge_id)) => {
                db::get_session(&self.pool, user_id, challenge_id)
                    .await?
                    .map(|row| row.instance_id)
                    .filter(|id| !is_lock_token(id))
            }
            (None, None) => {
                return Err(ApiError::Validation(
                    "either instance_id or challenge_id is required".to_string(),
                ));
            }
        };

        if let Some(id) = &resolved {
            self.orchestrator.stop_instance(id).await?;
        }

        match challenge_id {
            Some(challenge_id) => {
                // Sweep any stragglers for the pair, then drop the row.
                let owner = Owner {
                    user_id,
                    challenge_id,
                };
                self.orchestrator.stop_instances_for_owner(&owner).await?;
                db::delete_session(&self.pool, user_id, challenge_id).await?;
            }
            None => {
                if let Some(id) = &resolved {
                    db::delete_session_by_instance(&self.pool, user_id, id).await?;
                }
            }
        }

        Ok(())
    }

    /// Extend an instance's expiry.
    pub async fn extend(
        &self,
        user_id: i64,
        instance_id: Option<String>,
        challenge_id: Option<i64>,
        extend_by: Option<i64>,
    ) -> Result<ExtendOutcome> {
        let resolved = match (instance_id, challenge_id) {
            (Some(id), _) => Some(id),
            (None, Some(challenge_id)) => {
                db::get_session(&self.pool, user_id, challenge_id)
                    .await?
                    .map(|row| row.instance_id)
                    .filter(|id| !is_lock_token(id))
            }
            (None, None) => None,
        };

        let Some(id) = resolved else {
            return Err(ApiError::Validation(
                "no resolvable instance id".to_string(),
            ));
        };

        Ok(self.orchestrator.extend_instance(&id, extend_by).await?)
    }
}
