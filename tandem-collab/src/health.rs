//! Liveness, readiness and draining endpoints for the external router and
//! autoscaler.
//!
//! | Route          | Meaning                                              |
//! |----------------|------------------------------------------------------|
//! | `GET /healthz` | process responsive, always 200                       |
//! | `GET /readyz`  | 200 when new sessions are accepted, 503 otherwise    |
//! | `POST /drain`  | refuse new sessions, let existing ones finish        |
//!
//! Routing itself happens outside this crate. The contract it must honor is
//! that every connection for a document reaches the same instance; the
//! routing key is the document id, hashed with [`routing_key`].

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::document::DocumentId;
use crate::session::SessionCoordinator;

/// Whether this instance accepts new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    AtCapacity,
    Draining,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Body of `/readyz` and `/drain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: Readiness,
    pub instance_id: Uuid,
    pub sessions: usize,
    pub max_sessions: usize,
    pub documents: usize,
}

impl HealthReport {
    pub async fn collect(coordinator: &SessionCoordinator) -> Self {
        Self {
            status: coordinator.readiness(),
            instance_id: coordinator.registry().instance_id(),
            sessions: coordinator.session_count(),
            max_sessions: coordinator.config().max_sessions,
            documents: coordinator.registry().document_count().await,
        }
    }
}

/// Stable 64-bit FNV-1a hash of a document id for consistent-hash routers.
pub fn routing_key(document: &DocumentId) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    document
        .as_str()
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

/// HTTP router serving the health endpoints.
pub fn router(coordinator: Arc<SessionCoordinator>) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/drain", post(drain))
        .with_state(coordinator)
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(
    State(coordinator): State<Arc<SessionCoordinator>>,
) -> (StatusCode, Json<HealthReport>) {
    let report = HealthReport::collect(&coordinator).await;
    let status = if report.status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn drain(State(coordinator): State<Arc<SessionCoordinator>>) -> Json<HealthReport> {
    coordinator.begin_drain();
    Json(HealthReport::collect(&coordinator).await)
}
