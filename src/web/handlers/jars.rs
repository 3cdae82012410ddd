//! Jar receipt append, backfill, and jar listing handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::ApiError;
use crate::logging::now_ms;
use crate::receipts::{self, BackfillQuery, StoreReceiptInput, DEFAULT_BACKFILL_LIMIT};
use crate::storage::ReceiptRow;
use crate::validate;
use crate::web::auth::AuthenticatedCaller;
use crate::web::state::SharedState;

const MAX_JAR_ID_LEN: usize = 128;

fn validate_jar_id(jar_id: &str) -> Result<(), ApiError> {
    if jar_id.is_empty() || jar_id.len() > MAX_JAR_ID_LEN || jar_id.chars().any(char::is_control) {
        return Err(ApiError::validation(format!(
            "jar_id must be 1-{MAX_JAR_ID_LEN} printable characters"
        )));
    }
    Ok(())
}

fn caller_did(caller: &AuthenticatedCaller) -> Result<&str, ApiError> {
    caller.did.as_deref().ok_or_else(|| {
        ApiError::Forbidden("caller has no registered identity".to_string())
    })
}

#[derive(Deserialize)]
pub struct StoreReceiptRequest {
    /// Base64 of the raw CBOR receipt bytes.
    receipt_data: String,
    /// Base64 Ed25519 signature over those exact bytes.
    signature: String,
    /// Optional client-claimed CID; checked against the computed one.
    #[serde(default)]
    receipt_cid: Option<String>,
    #[serde(default)]
    parent_cid: Option<String>,
}

/// POST /api/jars/:jar_id/receipts — append one signed receipt.
///
/// 201 with the assigned sequence on first store; 200 with the stored
/// sequence when the same receipt (by CID) is submitted again.
pub async fn store_receipt_handler(
    State(state): State<SharedState>,
    Extension(_caller): Extension<AuthenticatedCaller>,
    Path(jar_id): Path<String>,
    Json(req): Json<StoreReceiptRequest>,
) -> Result<Response, ApiError> {
    validate_jar_id(&jar_id)?;

    let mut problems = Vec::new();
    if let Err(e) = validate::validate_base64("receipt_data", &req.receipt_data) {
        problems.push(e);
    }
    let signature = match validate::validate_signature("signature", &req.signature) {
        Ok(bytes) => bytes,
        Err(e) => {
            problems.push(e);
            Vec::new()
        }
    };
    if let Some(cid) = &req.receipt_cid {
        if let Err(e) = validate::validate_cid("receipt_cid", cid) {
            problems.push(e);
        }
    }
    if let Some(cid) = &req.parent_cid {
        if let Err(e) = validate::validate_cid("parent_cid", cid) {
            problems.push(e);
        }
    }
    if !problems.is_empty() {
        return Err(ApiError::Validation(problems));
    }

    let receipt_data = validate::decode_base64(&req.receipt_data)
        .map_err(|_| ApiError::validation("receipt_data is not valid base64"))?;

    let outcome = receipts::store_receipt(
        &state,
        StoreReceiptInput {
            jar_id,
            receipt_data,
            signature,
            claimed_cid: req.receipt_cid,
            parent_cid: req.parent_cid,
        },
        now_ms(),
    )
    .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(serde_json::json!({
            "jar_id": outcome.jar_id,
            "sequence_number": outcome.sequence_number,
            "receipt_cid": outcome.receipt_cid,
        })),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct BackfillParams {
    after: Option<i64>,
    limit: Option<u32>,
    from: Option<i64>,
    to: Option<i64>,
}

fn receipt_json(row: &ReceiptRow) -> serde_json::Value {
    serde_json::json!({
        "jar_id": row.jar_id,
        "sequence_number": row.sequence_number,
        "receipt_cid": row.receipt_cid,
        "receipt_data": STANDARD.encode(&row.receipt_data),
        "signature": STANDARD.encode(&row.signature),
        "sender_did": row.sender_did,
        "received_at": row.received_at,
        "parent_cid": row.parent_cid,
    })
}

/// GET /api/jars/:jar_id/receipts — backfill, either `after`+`limit` or
/// `from`+`to`, active members only.
pub async fn get_receipts_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Path(jar_id): Path<String>,
    Query(params): Query<BackfillParams>,
) -> Result<Response, ApiError> {
    validate_jar_id(&jar_id)?;

    let query = match (params.from, params.to) {
        (Some(from), Some(to)) => {
            if params.after.is_some() || params.limit.is_some() {
                return Err(ApiError::validation(
                    "use either after/limit or from/to, not both",
                ));
            }
            BackfillQuery::Range { from, to }
        }
        (None, None) => BackfillQuery::After {
            after: params.after.unwrap_or(0),
            limit: params.limit.unwrap_or(DEFAULT_BACKFILL_LIMIT),
        },
        _ => {
            return Err(ApiError::validation(
                "from and to must be supplied together",
            ))
        }
    };

    let st = state.lock().await;
    let rows = receipts::get_receipts(&st.storage, caller_did(&caller)?, &jar_id, query)?;
    let receipts: Vec<serde_json::Value> = rows.iter().map(receipt_json).collect();
    Ok(Json(serde_json::json!({
        "jar_id": jar_id,
        "receipts": receipts,
        "count": rows.len(),
    }))
    .into_response())
}

/// GET /api/jars/list — every jar the caller is an active member of.
pub async fn list_jars_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
) -> Result<Response, ApiError> {
    let st = state.lock().await;
    let jars = receipts::list_jars(&st.storage, caller_did(&caller)?)?;
    let jars: Vec<serde_json::Value> = jars
        .iter()
        .map(|(jar_id, role)| serde_json::json!({"jar_id": jar_id, "role": role}))
        .collect();
    Ok(Json(serde_json::json!({ "jars": jars })).into_response())
}
