//! Message send, inbox, delivery ack, and deletion handlers.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::error::ApiError;
use crate::logging::now_ms;
use crate::messages::{self, InboxMessage, SendInput, DEFAULT_INBOX_LIMIT};
use crate::validate;
use crate::web::auth::AuthenticatedCaller;
use crate::web::state::SharedState;

/// Resolve the caller's DID or refuse: every message operation is performed
/// as an identity, not a bare phone.
fn caller_did(caller: &AuthenticatedCaller) -> Result<&str, ApiError> {
    caller.did.as_deref().ok_or_else(|| {
        ApiError::Forbidden("caller has no registered identity".to_string())
    })
}

#[derive(Deserialize)]
pub struct SendRequest {
    message_id: String,
    receipt_cid: String,
    sender_did: String,
    sender_device_id: String,
    recipient_dids: Vec<String>,
    encrypted_payload: String,
    #[serde(default)]
    wrapped_keys: HashMap<String, String>,
    signature: String,
}

fn validate_send(req: &SendRequest) -> Result<(), ApiError> {
    let mut problems = Vec::new();
    if let Err(e) = validate::validate_uuid("message_id", &req.message_id) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_cid("receipt_cid", &req.receipt_cid) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_did("sender_did", &req.sender_did) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_uuid("sender_device_id", &req.sender_device_id) {
        problems.push(e);
    }
    if let Err(mut es) = validate::validate_recipients("recipient_dids", &req.recipient_dids) {
        problems.append(&mut es);
    }
    if let Err(e) = validate::validate_base64("encrypted_payload", &req.encrypted_payload) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_signature("signature", &req.signature) {
        problems.push(e);
    }
    for (device_id, wrapped) in &req.wrapped_keys {
        if let Err(e) = validate::validate_base64(&format!("wrapped_keys[{device_id}]"), wrapped) {
            problems.push(e);
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(problems))
    }
}

/// POST /api/messages/send — ingest one encrypted message and fan out a
/// silent push to the recipients' devices in the background.
pub async fn send_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(req): Json<SendRequest>,
) -> Result<Response, ApiError> {
    validate_send(&req)?;
    if caller_did(&caller)? != req.sender_did {
        return Err(ApiError::Forbidden(
            "sender_did does not match authenticated caller".to_string(),
        ));
    }

    let outcome = {
        let st = state.lock().await;
        messages::send(
            &st.storage,
            st.blobs.as_ref(),
            SendInput {
                message_id: req.message_id,
                receipt_cid: req.receipt_cid,
                sender_did: req.sender_did,
                sender_device_id: req.sender_device_id,
                recipient_dids: req.recipient_dids,
                encrypted_payload: req.encrypted_payload,
                wrapped_keys: req.wrapped_keys,
                signature: req.signature,
            },
            now_ms(),
        )?
    };

    // Detached: push must never delay or fail the send.
    tokio::spawn(crate::push::fan_out(
        state.clone(),
        outcome.recipient_dids.clone(),
    ));

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "message_id": outcome.message_id,
            "status": "accepted",
            "created_at": outcome.created_at,
            "expires_at": outcome.expires_at,
        })),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct InboxQuery {
    did: String,
    since: Option<i64>,
    limit: Option<u32>,
}

fn inbox_message_json(m: &InboxMessage) -> serde_json::Value {
    serde_json::json!({
        "message_id": m.message_id,
        "receipt_cid": m.receipt_cid,
        "sender_did": m.sender_did,
        "sender_device_id": m.sender_device_id,
        "recipient_dids": m.recipient_dids,
        "wrapped_keys": m.wrapped_keys,
        "signature": m.signature,
        "encrypted_payload": m.encrypted_payload,
        "created_at": m.created_at,
        "expires_at": m.expires_at,
    })
}

/// GET /api/messages/inbox?did=…&since=…&limit=…
pub async fn inbox_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Query(query): Query<InboxQuery>,
) -> Result<Response, ApiError> {
    validate::validate_did("did", &query.did).map_err(ApiError::validation)?;
    if caller_did(&caller)? != query.did {
        return Err(ApiError::Forbidden(
            "did does not match authenticated caller".to_string(),
        ));
    }

    let limit = query.limit.unwrap_or(DEFAULT_INBOX_LIMIT);
    let st = state.lock().await;
    let (inbox, has_more) = messages::inbox(
        &st.storage,
        st.blobs.as_ref(),
        &query.did,
        query.since,
        limit,
        now_ms(),
    )?;
    let messages: Vec<serde_json::Value> = inbox.iter().map(inbox_message_json).collect();
    Ok(Json(serde_json::json!({
        "messages": messages,
        "has_more": has_more,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub struct MarkDeliveredRequest {
    message_id: String,
    recipient_did: String,
}

/// POST /api/messages/mark-delivered
pub async fn mark_delivered_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Json(req): Json<MarkDeliveredRequest>,
) -> Result<Response, ApiError> {
    let mut problems = Vec::new();
    if let Err(e) = validate::validate_uuid("message_id", &req.message_id) {
        problems.push(e);
    }
    if let Err(e) = validate::validate_did("recipient_did", &req.recipient_did) {
        problems.push(e);
    }
    if !problems.is_empty() {
        return Err(ApiError::Validation(problems));
    }

    let st = state.lock().await;
    let delivered_at = messages::mark_delivered(
        &st.storage,
        caller_did(&caller)?,
        &req.message_id,
        &req.recipient_did,
        now_ms(),
    )?;
    Ok(Json(serde_json::json!({
        "message_id": req.message_id,
        "recipient_did": req.recipient_did,
        "delivered_at": delivered_at,
    }))
    .into_response())
}

/// DELETE /api/messages/:message_id
pub async fn delete_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
    Path(message_id): Path<String>,
) -> Result<Response, ApiError> {
    validate::validate_uuid("message_id", &message_id).map_err(ApiError::validation)?;

    let st = state.lock().await;
    messages::delete(
        &st.storage,
        st.blobs.as_ref(),
        caller_did(&caller)?,
        &message_id,
        now_ms(),
    )?;
    Ok(Json(serde_json::json!({ "deleted": true })).into_response())
}
