// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for instancer-server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use instancer_orchestrator::OrchestratorSettings;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL for the session store.
    pub database_url: String,
    /// HTTP bind address.
    pub bind_addr: SocketAddr,
    /// HS256 secret validating bearer tokens.
    pub auth_secret: String,
    /// Namespace/pool name for provisioned resources.
    pub namespace: String,
    /// Base TTL for new instances; `None` means unlimited.
    pub ttl_seconds: Option<i64>,
    /// Maximum total instance lifetime; `None` means uncapped.
    pub ttl_max_seconds: Option<i64>,
    /// Default extend window.
    pub extend_seconds: i64,
    /// Endpoint exposure mode (`LoadBalancer` or `ClusterIP`).
    pub service_type: String,
    /// Image pull secret names (comma-separated in the environment).
    pub image_pull_secrets: Vec<String>,
    /// Use the in-memory cluster fake instead of a real cluster.
    pub mock_cluster: bool,
    /// Optional JSON file mapping challenge ids to image configuration.
    pub challenges_file: Option<PathBuf>,
    /// Expiry sweep interval; `None` disables the sweeper.
    pub sweep_interval: Option<Duration>,
    /// Purge all session rows at startup.
    pub clear_sessions_on_start: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("INSTANCER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:instancer.db?mode=rwc".to_string());

        let bind_addr = std::env::var("INSTANCER_BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr)?;

        let auth_secret = std::env::var("INSTANCER_AUTH_SECRET")
            .map_err(|_| ConfigError::MissingEnvVar("INSTANCER_AUTH_SECRET"))?;

        let namespace =
            std::env::var("INSTANCER_NAMESPACE").unwrap_or_else(|_| "per-user".to_string());

        let ttl_seconds = positive_seconds("INSTANCER_TTL_SECONDS", Some(1800));
        let ttl_max_seconds = positive_seconds("INSTANCER_TTL_MAX_SECONDS", Some(3600));
        let extend_seconds = positive_seconds("INSTANCER_EXTEND_SECONDS", Some(300)).unwrap_or(300);

        let service_type =
            std::env::var("INSTANCER_SERVICE_TYPE").unwrap_or_else(|_| "LoadBalancer".to_string());

        let image_pull_secrets = std::env::var("INSTANCER_IMAGE_PULL_SECRETS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mock_cluster = bool_var("INSTANCER_MOCK_CLUSTER");

        let challenges_file = std::env::var("INSTANCER_CHALLENGES_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let sweep_interval = positive_seconds("INSTANCER_SWEEP_INTERVAL_SECONDS", None)
            .map(|secs| Duration::from_secs(secs as u64));

        let clear_sessions_on_start = bool_var("INSTANCER_CLEAR_SESSIONS_ON_START");

        Ok(Self {
            database_url,
            bind_addr,
            auth_secret,
            namespace,
            ttl_seconds,
            ttl_max_seconds,
            extend_seconds,
            service_type,
            image_pull_secrets,
            mock_cluster,
            challenges_file,
            sweep_interval,
            clear_sessions_on_start,
        })
    }

    /// Orchestrator settings derived from this configuration.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            namespace: self.namespace.clone(),
            ttl_seconds: self.ttl_seconds,
            ttl_max_seconds: self.ttl_max_seconds,
            extend_seconds: self.extend_seconds,
            service_type: self.service_type.clone(),
            image_pull_secrets: self.image_pull_secrets.clone(),
        }
    }
}

/// Parse a whole-second duration variable. Unset falls back to the
/// default; set but unparsable or non-positive yields `None`
/// (unlimited/disabled).
fn positive_seconds(var: &str, default: Option<i64>) -> Option<i64> {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(v) if v > 0 => Some(v),
            _ => None,
        },
        Err(_) => default,
    }
}

/// Truthy environment flag: `1`, `true`, or `yes` (case-insensitive).
fn bool_var(var: &str) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The bind address could not be parsed.
    #[error("Invalid bind address")]
    InvalidBindAddr,
}
