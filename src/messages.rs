//! Encrypted message relay: ingest, inbox, delivery acks, deletion.
//!
//! The relay never sees plaintext. Ingest authenticates the sending device,
//! offloads the ciphertext to the blob store, then records metadata and one
//! delivery row per recipient. The blob is written before the metadata row so
//! a visible row always resolves to a blob; the converse (an orphan blob from
//! a request that died mid-way) is reclaimed by the cleanup sweep.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::blobstore::{message_blob_key, BlobError, BlobMetadata, BlobStore};
use crate::error::ApiError;
use crate::rlog;
use crate::storage::{MessageRow, Storage, DEVICE_STATUS_ACTIVE};
use crate::validate::decode_base64;

/// Messages live 30 days from ingest.
pub const MESSAGE_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;

pub const DEFAULT_INBOX_LIMIT: u32 = 50;
pub const MAX_INBOX_LIMIT: u32 = 100;

pub struct SendInput {
    pub message_id: String,
    pub receipt_cid: String,
    pub sender_did: String,
    pub sender_device_id: String,
    pub recipient_dids: Vec<String>,
    /// Base64 ciphertext; decoded and stored as raw bytes.
    pub encrypted_payload: String,
    pub wrapped_keys: HashMap<String, String>,
    /// Base64 Ed25519 signature. Stored, not verified — verification is the
    /// recipient's job for direct messages.
    pub signature: String,
}

pub struct SendOutcome {
    pub message_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub recipient_dids: Vec<String>,
}

/// Ingest one encrypted message.
///
/// Field syntax is checked at the handler; this enforces the semantic steps
/// in order: sender device ownership, duplicate rejection, blob write,
/// metadata row, delivery rows. A blob-store failure aborts before any row
/// exists.
pub fn send(
    storage: &Storage,
    blobs: &dyn BlobStore,
    input: SendInput,
    now: i64,
) -> Result<SendOutcome, ApiError> {
    let device = storage
        .get_device(&input.sender_device_id)?
        .ok_or_else(|| ApiError::Forbidden("unknown sender device".to_string()))?;
    if device.status != DEVICE_STATUS_ACTIVE || device.owner_did != input.sender_did {
        return Err(ApiError::Forbidden(
            "device is not an active device of the sender".to_string(),
        ));
    }

    if storage.message_exists(&input.message_id)? {
        return Err(ApiError::Duplicate("message_id".to_string()));
    }

    let payload = decode_base64(&input.encrypted_payload)
        .map_err(|_| ApiError::validation("encrypted_payload is not valid base64"))?;

    let blob_key = message_blob_key(&input.message_id);
    blobs
        .put(
            &blob_key,
            &payload,
            &BlobMetadata {
                message_id: input.message_id.clone(),
                receipt_cid: input.receipt_cid.clone(),
                sender_did: input.sender_did.clone(),
                uploaded_at: now,
            },
        )
        .map_err(|e| ApiError::Internal(format!("blob store: {e}")))?;

    let row = MessageRow {
        message_id: input.message_id.clone(),
        receipt_cid: input.receipt_cid,
        sender_did: input.sender_did,
        sender_device_id: input.sender_device_id,
        recipient_dids: input.recipient_dids.clone(),
        wrapped_keys: input.wrapped_keys,
        signature: input.signature,
        blob_key: Some(blob_key),
        payload_inline: None,
        created_at: now,
        expires_at: now + MESSAGE_TTL_MS,
    };
    storage.insert_message(&row)?;
    for recipient in &input.recipient_dids {
        storage.insert_delivery(&input.message_id, recipient)?;
    }

    Ok(SendOutcome {
        message_id: input.message_id,
        created_at: now,
        expires_at: row.expires_at,
        recipient_dids: input.recipient_dids,
    })
}

/// One inbox entry in wire form: metadata plus the base64 ciphertext body.
pub struct InboxMessage {
    pub message_id: String,
    pub receipt_cid: String,
    pub sender_did: String,
    pub sender_device_id: String,
    pub recipient_dids: Vec<String>,
    pub wrapped_keys: HashMap<String, String>,
    pub signature: String,
    pub encrypted_payload: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Fetch undelivered-or-not messages addressed to `did`, newest first.
///
/// Blob-backed rows are hydrated from the object store and re-encoded as
/// base64 for the wire; legacy rows still carrying inline ciphertext are
/// served as-is until they expire.
pub fn inbox(
    storage: &Storage,
    blobs: &dyn BlobStore,
    did: &str,
    since: Option<i64>,
    limit: u32,
    now: i64,
) -> Result<(Vec<InboxMessage>, bool), ApiError> {
    let limit = limit.min(MAX_INBOX_LIMIT).max(1);
    let rows = storage.inbox(did, since, limit, now)?;
    let has_more = rows.len() as u32 == limit;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let encrypted_payload = match (&row.blob_key, &row.payload_inline) {
            (Some(blob_key), _) => match blobs.get(blob_key) {
                Ok(bytes) => STANDARD.encode(bytes),
                Err(BlobError::NotFound(_)) => {
                    rlog!(
                        Error,
                        "inbox: metadata row {} references missing blob",
                        crate::logging::short_id(&row.message_id)
                    );
                    continue;
                }
                Err(e) => return Err(ApiError::Internal(format!("blob store: {e}"))),
            },
            (None, Some(inline)) => inline.clone(),
            (None, None) => {
                rlog!(
                    Error,
                    "inbox: row {} has neither blob nor inline payload",
                    crate::logging::short_id(&row.message_id)
                );
                continue;
            }
        };
        messages.push(InboxMessage {
            message_id: row.message_id,
            receipt_cid: row.receipt_cid,
            sender_did: row.sender_did,
            sender_device_id: row.sender_device_id,
            recipient_dids: row.recipient_dids,
            wrapped_keys: row.wrapped_keys,
            signature: row.signature,
            encrypted_payload,
            created_at: row.created_at,
            expires_at: row.expires_at,
        });
    }
    Ok((messages, has_more))
}

/// Acknowledge delivery of a message to the calling recipient.
pub fn mark_delivered(
    storage: &Storage,
    caller_did: &str,
    message_id: &str,
    recipient_did: &str,
    now: i64,
) -> Result<i64, ApiError> {
    if caller_did != recipient_did {
        return Err(ApiError::Forbidden(
            "only the recipient may acknowledge delivery".to_string(),
        ));
    }
    if storage.mark_delivered(message_id, recipient_did, now)? {
        Ok(now)
    } else {
        Err(ApiError::NotFound("pending delivery".to_string()))
    }
}

/// Delete a message: the sender may before expiry, anyone after.
///
/// The blob goes first so a failure leaves the row (and a retryable delete)
/// rather than an unreachable blob.
pub fn delete(
    storage: &Storage,
    blobs: &dyn BlobStore,
    caller_did: &str,
    message_id: &str,
    now: i64,
) -> Result<(), ApiError> {
    let row = storage
        .get_message(message_id)?
        .ok_or_else(|| ApiError::NotFound("message".to_string()))?;

    let allowed = row.sender_did == caller_did || row.expires_at < now;
    if !allowed {
        return Err(ApiError::Forbidden(
            "only the sender may delete an unexpired message".to_string(),
        ));
    }

    if let Some(blob_key) = &row.blob_key {
        blobs
            .delete(blob_key)
            .map_err(|e| ApiError::Internal(format!("blob store: {e}")))?;
    }
    storage.delete_message(message_id)?;
    Ok(())
}
