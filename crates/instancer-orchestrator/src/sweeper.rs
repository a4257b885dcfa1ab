// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that reaps expired instances nobody polls.
//!
//! Expiry is normally enforced lazily, as a side effect of a status read.
//! An instance whose owner walks away would stay provisioned until an
//! owner-wide stop. This optional sweep closes that gap by periodically
//! running the same status check over every managed workload; the check
//! itself deletes instances found past their expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{InstanceState, Orchestrator};

/// Periodic expiry sweep over all managed instances.
pub struct ExpirySweeper {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ExpirySweeper {
    /// Create a sweeper running every `interval`.
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Expiry sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Expiry sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Sweep cycle failed");
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// Run one sweep cycle. Returns (checked, reaped).
    ///
    /// Per-instance failures are logged and swallowed so one broken
    /// instance cannot stall the rest of the sweep.
    pub async fn sweep_once(&self) -> crate::error::Result<(u64, u64)> {
        let names = self.orchestrator.managed_instances().await?;
        let mut checked = 0u64;
        let mut reaped = 0u64;

        for name in names {
            checked += 1;
            match self.orchestrator.status(&name).await {
                Ok(status) if status.status == InstanceState::Expired => reaped += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(instance_id = %name, error = %e, "Failed to check instance during sweep");
                }
            }
        }

        if reaped > 0 {
            info!(checked, reaped, "Sweep cycle completed");
        } else {
            debug!(checked, "Sweep cycle completed, nothing expired");
        }

        Ok((checked, reaped))
    }
}
