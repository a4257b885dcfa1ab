// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for instancer-orchestrator.

use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Operation target does not exist. Only extend treats absence as an
    /// error; stop and status report `stopped` instead.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// A cluster API call failed during create, patch, or list.
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// The cluster client could not be initialized at all. Distinct from a
    /// per-call failure; callers surface this as "service unavailable".
    #[error("Cluster client unavailable: {0}")]
    ClientUnavailable(String),

    /// Resource descriptor construction failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using OrchestratorError.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
