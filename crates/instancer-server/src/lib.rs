// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP front end for per-user challenge instances.
//!
//! Exposes a small JSON API (`/instances/start`, `/instances/status`,
//! `/instances/stop`, `/instances/extend`) over the orchestrator in
//! [`instancer_orchestrator`]. Identity comes from an HS256 bearer
//! token; per-(user, challenge) serialization is handled by the
//! [`coordinator::SessionCoordinator`] on top of a SQLite session
//! table with a unique constraint.

#![deny(missing_docs)]

pub mod auth;
pub mod challenges;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod routes;
