//! Device registration, listing, and heartbeat.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{extract::State, Extension, Json};
use serde::Deserialize;

use crate::error::ApiError;
use crate::identity::{self, RegisterDeviceInput};
use crate::logging::now_ms;
use crate::storage::DeviceRow;
use crate::validate;
use crate::web::auth::AuthenticatedCaller;
use crate::web::state::SharedState;

const MAX_DEVICE_NAME_LEN: usize = 100;

#[derive(Deserialize)]
pub struct RegisterRequest {
    device_id: String,
    device_name: String,
    owner_did: String,
    phone: String,
    pubkey_x25519: String,
    pubkey_ed25519: String,
    #[serde(default)]
    push_token: Option<String>,
}

fn validate_register(req: &RegisterRequest) -> Result<(), ApiError> {
    let mut problems = Vec::new();
    if let Err(e) = validate::validate_uuid("device_id", &req.device_id) {
        problems.push(e);
    }
    if req.device_name.trim().is_empty() || req.device_name.len() > MAX_DEVICE_NAME_LEN {
        problems.push(format!(
            "device_name must be 1-{MAX_DEVICE_NAME_LEN} characters"
        ));
    }
    if let Err(e) = validate::validate_did("owner_did", &req.owner_did) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_phone("phone", &req.phone) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_base64("pubkey_x25519", &req.pubkey_x25519) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_base64("pubkey_ed25519", &req.pubkey_ed25519) {
        problems.push(e);
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(problems))
    }
}

/// POST /api/devices/register — register or re-register a device.
pub async fn register_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(req): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    validate_register(&req)?;

    let now = now_ms();
    let st = state.lock().await;
    let (row, created) = identity::register_device(
        &st.storage,
        &st.cipher,
        &caller.phone,
        RegisterDeviceInput {
            device_id: req.device_id,
            device_name: req.device_name,
            owner_did: req.owner_did,
            phone: req.phone,
            pubkey_x25519: req.pubkey_x25519,
            pubkey_ed25519: req.pubkey_ed25519,
            push_token: req.push_token,
        },
        now,
    )?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(serde_json::json!({
            "device_id": row.device_id,
            "owner_did": row.owner_did,
            "status": row.status,
            "registered_at": row.registered_at,
            "last_seen_at": row.last_seen_at,
        })),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct ListDevicesRequest {
    dids: Vec<String>,
}

/// Public wire form of a device: no push token ever leaves the relay.
fn device_json(row: &DeviceRow) -> serde_json::Value {
    serde_json::json!({
        "device_id": row.device_id,
        "owner_did": row.owner_did,
        "device_name": row.device_name,
        "pubkey_x25519": row.pubkey_x25519,
        "pubkey_ed25519": row.pubkey_ed25519,
        "registered_at": row.registered_at,
        "last_seen_at": row.last_seen_at,
    })
}

/// POST /api/devices/list — active devices for up to 12 DIDs.
pub async fn list_handler(
    State(state): State<SharedState>,
    Extension(_caller): Extension<AuthenticatedCaller>,
    Json(req): Json<ListDevicesRequest>,
) -> Result<Response, ApiError> {
    validate::validate_recipients("dids", &req.dids).map_err(ApiError::Validation)?;

    let st = state.lock().await;
    let devices = identity::list_devices(&st.storage, &req.dids)?;
    let devices: Vec<serde_json::Value> = devices.iter().map(device_json).collect();
    Ok(Json(serde_json::json!({ "devices": devices })).into_response())
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    device_id: String,
}

/// POST /api/devices/heartbeat — refresh last_seen_at.
pub async fn heartbeat_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Response, ApiError> {
    validate::validate_uuid("device_id", &req.device_id).map_err(ApiError::validation)?;

    let st = state.lock().await;
    let last_seen_at =
        identity::heartbeat(&st.storage, &st.cipher, &caller.phone, &req.device_id, now_ms())?;
    Ok(Json(serde_json::json!({
        "device_id": req.device_id,
        "last_seen_at": last_seen_at,
    }))
    .into_response())
}
