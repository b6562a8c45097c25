// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded HTTP health endpoint.
//!
//! A single route, `GET /health`, answering a JSON document with HTTP
//! 200 while the bridge is healthy or degraded and 503 once it is
//! unhealthy. Anything else is 404/405, courtesy of the router.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use parking_lot::RwLock;
use serde_json::{Value, json};
use sysinfo::System;
use tokio::time::Instant;

/// Mutable health figures, updated by the bridge loop.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    /// Enabled accounts.
    pub accounts_total: usize,
    /// Accounts with a live cloud session.
    pub accounts_connected: usize,
    /// Devices across all accounts.
    pub devices_total: usize,
    /// Devices the vendor reports online.
    pub devices_online: usize,
    /// Whether the local broker session is up.
    pub local_broker_connected: bool,
}

/// Shared handle between the bridge loop and the HTTP server.
#[derive(Clone)]
pub struct HealthState {
    started_at: Instant,
    snapshot: Arc<RwLock<HealthSnapshot>>,
}

impl HealthState {
    /// Creates the state with nothing connected yet.
    #[must_use]
    pub fn new(accounts_total: usize) -> Self {
        Self {
            started_at: Instant::now(),
            snapshot: Arc::new(RwLock::new(HealthSnapshot {
                accounts_total,
                accounts_connected: 0,
                devices_total: 0,
                devices_online: 0,
                local_broker_connected: false,
            })),
        }
    }

    /// Applies an update from the bridge loop.
    pub fn update(&self, apply: impl FnOnce(&mut HealthSnapshot)) {
        apply(&mut self.snapshot.write());
    }

    /// Renders the health document and its HTTP status.
    #[must_use]
    pub fn document(&self) -> (StatusCode, Value) {
        let snapshot = self.snapshot.read().clone();
        let status = if !snapshot.local_broker_connected || snapshot.accounts_connected == 0 {
            "unhealthy"
        } else if snapshot.accounts_connected < snapshot.accounts_total {
            "degraded"
        } else {
            "healthy"
        };
        let http_status = if status == "unhealthy" {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };

        let (usage_mb, limit_mb) = memory_figures();
        let document = json!({
            "status": status,
            "uptime": self.started_at.elapsed().as_secs(),
            "accounts": {
                "total": snapshot.accounts_total,
                "connected": snapshot.accounts_connected,
                "disconnected": snapshot.accounts_total - snapshot.accounts_connected,
            },
            "devices": {
                "total": snapshot.devices_total,
                "online": snapshot.devices_online,
                "offline": snapshot.devices_total - snapshot.devices_online,
            },
            "mqtt": {
                "cloud_clients": snapshot.accounts_connected,
                "local_broker": snapshot.local_broker_connected,
            },
            "memory": {
                "usage_mb": usage_mb,
                "limit_mb": limit_mb,
            },
        });
        (http_status, document)
    }
}

/// Resident set of this process and total system memory, in MiB.
fn memory_figures() -> (u64, u64) {
    let mut system = System::new();
    let pid = sysinfo::Pid::from_u32(std::process::id());
    system.refresh_process(pid);
    system.refresh_memory();
    let usage = system
        .process(pid)
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0);
    let limit = system.total_memory() / (1024 * 1024);
    (usage, limit)
}

/// Starts the server on `port`. The returned task runs until aborted.
///
/// # Errors
///
/// Returns the bind failure, which the bridge treats as fatal: a
/// requested health endpoint that cannot listen is a misconfiguration.
pub async fn spawn(state: HealthState, port: u16) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let app = axum::Router::new()
        .route("/health", get(health_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Health endpoint listening");
    Ok(tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "Health server stopped");
        }
    }))
}

async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let (status, document) = state.document();
    (status, Json(document))
}
