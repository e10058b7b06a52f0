use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use typeshare::typeshare;

use super::identity::ClientIdentity;
use crate::error::Result;
use crate::gadget::{GadgetStatus, LockInfo, Mode};
use crate::state::AppState;

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Gadget Mode
// ============================================================================

#[typeshare]
#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub mode: Mode,
    /// Accepted for compatibility, not interpreted
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[typeshare]
#[derive(Debug, Deserialize)]
pub struct LockRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct LockResponse {
    pub success: bool,
    pub lock: LockInfo,
}

pub async fn gadget_status(State(state): State<Arc<AppState>>) -> Json<GadgetStatus> {
    Json(state.controller.status())
}

/// Resolves only after the whole activation sequence has finished
pub async fn gadget_activate(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientIdentity>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<ActionResponse>> {
    state
        .controller
        .activate(client.as_str(), req.mode, req.options)
        .await?;
    Ok(ActionResponse::ok(format!("{} activated", req.mode)))
}

pub async fn gadget_deactivate(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientIdentity>,
) -> Result<Json<ActionResponse>> {
    state.controller.deactivate(client.as_str()).await?;
    Ok(ActionResponse::ok("Gadget deactivated"))
}

pub async fn gadget_lock(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientIdentity>,
    Json(req): Json<LockRequest>,
) -> Result<Json<LockResponse>> {
    let lock = state.controller.acquire_lock(client.as_str(), &req.reason)?;
    Ok(Json(LockResponse {
        success: true,
        lock,
    }))
}

pub async fn gadget_unlock(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientIdentity>,
) -> Result<Json<ActionResponse>> {
    state.controller.release_lock(client.as_str())?;
    Ok(ActionResponse::ok("Lock released"))
}
