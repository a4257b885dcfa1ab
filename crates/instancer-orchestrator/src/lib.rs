// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instancer Orchestrator - Ephemeral Instance Lifecycle
//!
//! This crate manages per-user challenge instances on a Kubernetes-style
//! cluster. Each instance is a workload (Deployment) paired with a network
//! endpoint (Service), both labeled with the owning user and challenge so
//! they can be found and cleaned up later. Instance lifetimes are tracked
//! as whole-second Unix timestamps stored in workload annotations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 instancer-server                          │
//! │            (sessions, HTTP API, auth)                     │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │            instancer-orchestrator (This Crate)            │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────────┐  │
//! │  │  Instance  │  │ TTL/Expiry │  │   Expiry Sweeper   │  │
//! │  │ Lifecycle  │  │    Math    │  │     (optional)     │  │
//! │  └────────────┘  └────────────┘  └────────────────────┘  │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │ ClusterApi trait
//!              ┌─────────────┴─────────────┐
//!              ▼                           ▼
//!       ┌─────────────┐            ┌─────────────┐
//!       │ KubeCluster │            │ MockCluster │
//!       │  (kube-rs)  │            │ (in-memory) │
//!       └─────────────┘            └─────────────┘
//! ```
//!
//! # Instance status
//!
//! Status is never stored. It is derived on read from resource presence,
//! the backing pod phase, and the expiry annotation versus the current
//! time:
//!
//! | Status     | Meaning |
//! |------------|---------|
//! | `starting` | Workload exists, pod not yet `Running` |
//! | `running`  | Workload exists, pod `Running`, not expired |
//! | `expired`  | Expiry timestamp passed; reaped as a side effect of the read |
//! | `stopped`  | Workload absent |
//!
//! There is no background reaper by default: expiry is enforced lazily at
//! the next status read. The optional [`sweeper`] closes the gap for
//! instances nobody polls.

#![deny(missing_docs)]

/// Injectable clock so TTL and expiry math is testable.
pub mod clock;

/// Cluster API seam: trait plus real (kube) and mock implementations.
pub mod cluster;

/// Error types for orchestrator operations.
pub mod error;

/// Label and annotation conventions shared by all managed resources.
pub mod labels;

/// Instance lifecycle operations: start, status, extend, stop, cleanup.
pub mod orchestrator;

/// Optional periodic sweep that reaps expired instances nobody polls.
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterApi, KubeCluster, MockCluster};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{
    ExtendOutcome, InstanceState, InstanceStatus, Orchestrator, OrchestratorSettings, Owner,
    StartedInstance,
};
pub use sweeper::ExpirySweeper;
