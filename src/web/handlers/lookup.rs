//! Phone → DID resolution.
//!
//! Single lookups 404 on unknown phones; batch lookups silently omit them.
//! Enumeration is bounded by the 20/min rate limit on both endpoints.

use axum::response::{IntoResponse, Response};
use axum::{extract::State, Extension, Json};
use serde::Deserialize;

use crate::error::ApiError;
use crate::identity;
use crate::validate::{self, MAX_BATCH_PHONES};
use crate::web::auth::AuthenticatedCaller;
use crate::web::state::SharedState;

#[derive(Deserialize)]
pub struct LookupRequest {
    phone: String,
}

/// POST /api/lookup/did
pub async fn lookup_handler(
    State(state): State<SharedState>,
    Extension(_caller): Extension<AuthenticatedCaller>,
    Json(req): Json<LookupRequest>,
) -> Result<Response, ApiError> {
    validate::validate_phone("phone", &req.phone).map_err(ApiError::validation)?;

    let st = state.lock().await;
    let did = identity::lookup_did(&st.storage, &st.cipher, &req.phone)?;
    Ok(Json(serde_json::json!({ "did": did })).into_response())
}

#[derive(Deserialize)]
pub struct BatchLookupRequest {
    phones: Vec<String>,
}

/// POST /api/lookup/batch — up to 12 phones at once.
pub async fn batch_lookup_handler(
    State(state): State<SharedState>,
    Extension(_caller): Extension<AuthenticatedCaller>,
    Json(req): Json<BatchLookupRequest>,
) -> Result<Response, ApiError> {
    let mut problems = Vec::new();
    if req.phones.is_empty() {
        problems.push("phones must contain at least one number".to_string());
    }
    if req.phones.len() > MAX_BATCH_PHONES {
        problems.push(format!("phones must contain at most {MAX_BATCH_PHONES} numbers"));
    } else {
        for (i, phone) in req.phones.iter().enumerate() {
            if let Err(e) = validate::validate_phone(&format!("phones[{i}]"), phone) {
                problems.push(e);
            }
        }
    }
    if !problems.is_empty() {
        return Err(ApiError::Validation(problems));
    }

    let st = state.lock().await;
    let dids = identity::batch_lookup_did(&st.storage, &st.cipher, &req.phones)?;
    Ok(Json(serde_json::json!({ "dids": dids })).into_response())
}
