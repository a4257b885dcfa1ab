// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routes and handlers.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::{Pool, Sqlite};
use tower_http::trace::TraceLayer;

use instancer_orchestrator::{ExtendOutcome, InstanceStatus};

use crate::auth::Identity;
use crate::challenges::ChallengeSource;
use crate::coordinator::{SessionCoordinator, StartResponse, StatusTarget};
use crate::error::{ApiError, Result};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session store pool.
    pub pool: Pool<Sqlite>,
    /// Coordinator, absent when no cluster client could be built.
    pub coordinator: Option<Arc<SessionCoordinator>>,
    /// Challenge configuration source.
    pub challenges: Arc<dyn ChallengeSource>,
    /// Secret validating bearer tokens.
    pub auth_secret: String,
    /// Process start, for the uptime report.
    pub start_time: Instant,
    /// Reported version string.
    pub version: &'static str,
}

impl AppState {
    fn coordinator(&self) -> Result<&Arc<SessionCoordinator>> {
        self.coordinator.as_ref().ok_or(ApiError::ServiceUnavailable)
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/instances/start", post(start_instance))
        .route("/instances/status", get(instance_status))
        .route("/instances/stop", post(stop_instance))
        .route("/instances/extend", post(extend_instance))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Result<Json<Value>> {
    crate::db::health_check(&state.pool).await?;
    Ok(Json(json!({
        "healthy": true,
        "version": state.version,
        "uptime_ms": state.start_time.elapsed().as_millis() as u64,
        "cluster": state.coordinator.is_some(),
    })))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    challenge_id: i64,
}

async fn start_instance(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>> {
    let coordinator = state.coordinator()?;

    let challenge = state
        .challenges
        .lookup(request.challenge_id)
        .ok_or_else(|| {
            ApiError::NotFound(format!("challenge {}", request.challenge_id))
        })?;

    tracing::info!(
        user_id = identity.user_id,
        challenge_id = request.challenge_id,
        "Start requested"
    );

    let response = coordinator
        .start(identity.user_id, request.challenge_id, &challenge)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    instance_id: Option<String>,
    challenge_id: Option<i64>,
}

async fn instance_status(
    State(state): State<AppState>,
    identity: Identity,
    Query(query): Query<StatusQuery>,
) -> Result<Json<InstanceStatus>> {
    let coordinator = state.coordinator()?;

    let target = match (query.instance_id, query.challenge_id) {
        (Some(id), _) => StatusTarget::Instance(id),
        (None, Some(challenge_id)) => StatusTarget::Challenge(challenge_id),
        (None, None) => {
            return Err(ApiError::Validation(
                "either instance_id or challenge_id is required".to_string(),
            ));
        }
    };

    let status = coordinator.status(identity.user_id, target).await?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    instance_id: Option<String>,
    challenge_id: Option<i64>,
}

async fn stop_instance(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<StopRequest>,
) -> Result<Json<Value>> {
    let coordinator = state.coordinator()?;

    tracing::info!(
        user_id = identity.user_id,
        instance_id = request.instance_id.as_deref().unwrap_or("-"),
        "Stop requested"
    );

    coordinator
        .stop(identity.user_id, request.instance_id, request.challenge_id)
        .await?;
    Ok(Json(json!({ "status": "stopped" })))
}

#[derive(Debug, Deserialize)]
struct ExtendRequest {
    instance_id: Option<String>,
    challenge_id: Option<i64>,
    extend_seconds: Option<i64>,
}

async fn extend_instance(
    State(state): State<AppState>,
    identity: Identity,
    Json(request): Json<ExtendRequest>,
) -> Result<Json<ExtendOutcome>> {
    let coordinator = state.coordinator()?;

    let outcome = coordinator
        .extend(
            identity.user_id,
            request.instance_id,
            request.challenge_id,
            request.extend_seconds,
        )
        .await?;
    Ok(Json(outcome))
}
