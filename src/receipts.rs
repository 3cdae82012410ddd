//! Jar receipt log: append, sequence, materialize, backfill.
//!
//! Receipts are the source of truth for jar state. The relay verifies
//! integrity (CID), authenticity (Ed25519 over the exact receipt bytes) and
//! authorization (membership, or genesis for an empty jar), then assigns the
//! next dense per-jar sequence number. The membership view in `jar_members`
//! is only a materialization: failures there are logged and repaired by
//! replay, never allowed to roll back a stored receipt.

use std::fmt;
use std::time::Duration;

use crate::encoding::{self, ReceiptEnvelope};
use crate::error::ApiError;
use crate::rlog;
use crate::storage::{
    JarMemberRow, ReceiptRow, Storage, StorageError, MEMBER_STATUS_ACTIVE, ROLE_MEMBER,
    ROLE_OWNER,
};
use crate::web::state::SharedState;
use crate::{crypto, logging};

/// Active members a jar may hold before `jar.member_added` is refused.
pub const MAX_JAR_MEMBERS: i64 = 64;

/// Bounded retry for the sequence-assignment race.
const SEQUENCE_MAX_ATTEMPTS: u32 = 5;
const SEQUENCE_BACKOFF_MS: u64 = 10;

pub const DEFAULT_BACKFILL_LIMIT: u32 = 500;
pub const MAX_BACKFILL_LIMIT: u32 = 1000;

pub const RECEIPT_TYPE_CREATED: &str = "jar.created";
pub const RECEIPT_TYPE_MEMBER_ADDED: &str = "jar.member_added";
pub const RECEIPT_TYPE_INVITE_ACCEPTED: &str = "jar.invite_accepted";
pub const RECEIPT_TYPE_MEMBER_REMOVED: &str = "jar.member_removed";

pub struct StoreReceiptInput {
    pub jar_id: String,
    /// Raw CBOR bytes, exactly as signed.
    pub receipt_data: Vec<u8>,
    /// Raw Ed25519 signature bytes.
    pub signature: Vec<u8>,
    /// CID claimed by the client, if any; must match the computed one.
    pub claimed_cid: Option<String>,
    pub parent_cid: Option<String>,
}

pub struct StoreReceiptOutcome {
    pub jar_id: String,
    pub sequence_number: i64,
    pub receipt_cid: String,
    /// False when this was an idempotent replay of a stored receipt.
    pub created: bool,
}

#[derive(Debug)]
pub enum MaterializeError {
    MissingMemberDid,
    NoSuchMemberRow(String),
    Storage(StorageError),
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::MissingMemberDid => write!(f, "payload has no member_did"),
            MaterializeError::NoSuchMemberRow(did) => {
                write!(f, "no membership row for {did}")
            }
            MaterializeError::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl From<StorageError> for MaterializeError {
    fn from(e: StorageError) -> Self {
        MaterializeError::Storage(e)
    }
}

/// Append a receipt to a jar's log.
///
/// The pipeline order is fixed: parse, CID, idempotency, key lookup,
/// signature, authorization, parent check, sequence assignment,
/// materialization. Retried submissions of the same bytes are safe at any
/// point — the receipt CID is globally unique and the stored row wins.
pub async fn store_receipt(
    state: &SharedState,
    input: StoreReceiptInput,
    now: i64,
) -> Result<StoreReceiptOutcome, ApiError> {
    // 1. Parse. A malformed envelope or ill-formed sender is a 400.
    let envelope = encoding::decode_receipt(&input.receipt_data)
        .map_err(|e| ApiError::validation(format!("receipt_data: {e}")))?;

    // 2. Integrity. The CID is computed here; a claimed CID must match.
    let receipt_cid = encoding::compute_cid(&input.receipt_data);
    if let Some(claimed) = &input.claimed_cid {
        if claimed != &receipt_cid {
            return Err(ApiError::validation("receipt_cid does not match receipt_data"));
        }
    }

    {
        let st = state.lock().await;

        // 3. Idempotency: a stored CID short-circuits everything else.
        if let Some(existing) = st.storage.get_receipt_by_cid(&receipt_cid)? {
            return Ok(StoreReceiptOutcome {
                jar_id: existing.jar_id,
                sequence_number: existing.sequence_number,
                receipt_cid,
                created: false,
            });
        }

        // 4–6. Authenticity and authorization.
        authorize(&st.storage, &input, &envelope)?;

        // 7. A missing parent is tolerated; clients backfill out of order.
        if let Some(parent) = &input.parent_cid {
            if !st.storage.receipt_cid_exists(parent)? {
                rlog!(
                    Warn,
                    "receipts: parent {} not found for jar {}, accepting anyway",
                    logging::short_id(parent),
                    logging::short_id(&input.jar_id)
                );
            }
        }
    }

    // 8. Sequence assignment. The (jar_id, sequence_number) unique constraint
    // is the correctness anchor; on violation, back off and retry.
    let mut sequence_number = None;
    for attempt in 1..=SEQUENCE_MAX_ATTEMPTS {
        let result = {
            let st = state.lock().await;
            // Another writer may have stored this very receipt meanwhile.
            if let Some(existing) = st.storage.get_receipt_by_cid(&receipt_cid)? {
                return Ok(StoreReceiptOutcome {
                    jar_id: existing.jar_id,
                    sequence_number: existing.sequence_number,
                    receipt_cid,
                    created: false,
                });
            }
            st.storage.insert_receipt_next_seq(
                &input.jar_id,
                &receipt_cid,
                &input.receipt_data,
                &input.signature,
                &envelope.sender_did,
                now,
                input.parent_cid.as_deref(),
            )
        };
        match result {
            Ok(sequence) => {
                sequence_number = Some(sequence);
                break;
            }
            Err(StorageError::Conflict(_)) if attempt < SEQUENCE_MAX_ATTEMPTS => {
                tokio::time::sleep(Duration::from_millis(
                    SEQUENCE_BACKOFF_MS * u64::from(attempt),
                ))
                .await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    let sequence_number = sequence_number
        .ok_or_else(|| ApiError::Internal("sequence assignment exhausted retries".to_string()))?;

    // 9. Materialization is non-fatal: the receipt row is already the truth.
    {
        let st = state.lock().await;
        if let Err(e) = materialize(&st.storage, &input.jar_id, &receipt_cid, &envelope) {
            rlog!(
                Warn,
                "receipts: materialization of {} failed ({e}), view is rebuildable",
                logging::short_id(&receipt_cid)
            );
        }
    }

    rlog!(
        Info,
        "receipts: stored seq {} in jar {} from {}",
        sequence_number,
        logging::short_id(&input.jar_id),
        logging::short_id(&envelope.sender_did)
    );

    Ok(StoreReceiptOutcome {
        jar_id: input.jar_id,
        sequence_number,
        receipt_cid,
        created: true,
    })
}

/// Steps 4–6: key lookup, signature verification, membership authorization.
///
/// A sender with no active device key, a failed verification, and a
/// non-member write to a non-empty jar all surface as 403.
pub fn authorize(
    storage: &Storage,
    input: &StoreReceiptInput,
    envelope: &ReceiptEnvelope,
) -> Result<(), ApiError> {
    let public_key = storage
        .latest_active_ed25519(&envelope.sender_did)?
        .ok_or_else(|| {
            ApiError::Forbidden("sender has no active device".to_string())
        })?;

    crypto::verify_signature(&public_key, &input.receipt_data, &input.signature)
        .map_err(|_| ApiError::Forbidden("receipt signature verification failed".to_string()))?;

    let is_member = storage.is_active_member(&input.jar_id, &envelope.sender_did)?;
    if !is_member {
        // Only the genesis receipt of an empty jar may come from a
        // non-member: its signer becomes the owner.
        if storage.has_receipts(&input.jar_id)? {
            return Err(ApiError::Forbidden(
                "sender is not a member of this jar".to_string(),
            ));
        }
    }

    // Owner assignment happens exactly once, at sequence 1. A second
    // genesis with different bytes would re-materialize ownership.
    if envelope.receipt_type == RECEIPT_TYPE_CREATED && storage.has_receipts(&input.jar_id)? {
        return Err(ApiError::validation("jar already has a genesis receipt"));
    }

    if envelope.receipt_type == RECEIPT_TYPE_MEMBER_ADDED
        && storage.count_active_members(&input.jar_id)? >= MAX_JAR_MEMBERS
    {
        return Err(ApiError::CircleLimitExceeded);
    }

    Ok(())
}

/// Apply one receipt to the materialized membership view.
pub fn materialize(
    storage: &Storage,
    jar_id: &str,
    receipt_cid: &str,
    envelope: &ReceiptEnvelope,
) -> Result<(), MaterializeError> {
    match envelope.receipt_type.as_str() {
        RECEIPT_TYPE_CREATED => {
            storage.upsert_member(&JarMemberRow {
                jar_id: jar_id.to_string(),
                member_did: envelope.sender_did.clone(),
                status: MEMBER_STATUS_ACTIVE.to_string(),
                role: ROLE_OWNER.to_string(),
                added_at: envelope.timestamp,
                removed_at: None,
                added_by_receipt_cid: Some(receipt_cid.to_string()),
                removed_by_receipt_cid: None,
            })?;
        }
        RECEIPT_TYPE_MEMBER_ADDED => {
            let member_did = payload_member_did(envelope)?;
            // The invite-acceptance intermediate state is unused today;
            // members land directly active.
            storage.upsert_member(&JarMemberRow {
                jar_id: jar_id.to_string(),
                member_did,
                status: MEMBER_STATUS_ACTIVE.to_string(),
                role: ROLE_MEMBER.to_string(),
                added_at: envelope.timestamp,
                removed_at: None,
                added_by_receipt_cid: Some(receipt_cid.to_string()),
                removed_by_receipt_cid: None,
            })?;
        }
        RECEIPT_TYPE_INVITE_ACCEPTED => {
            let member_did =
                payload_member_did(envelope).unwrap_or_else(|_| envelope.sender_did.clone());
            if !storage.set_member_active(jar_id, &member_did)? {
                return Err(MaterializeError::NoSuchMemberRow(member_did));
            }
        }
        RECEIPT_TYPE_MEMBER_REMOVED => {
            let member_did = payload_member_did(envelope)?;
            if !storage.set_member_removed(jar_id, &member_did, envelope.timestamp, receipt_cid)? {
                return Err(MaterializeError::NoSuchMemberRow(member_did));
            }
        }
        other => {
            rlog!(Info, "receipts: ignoring unknown receipt type {other}");
        }
    }
    Ok(())
}

fn payload_member_did(envelope: &ReceiptEnvelope) -> Result<String, MaterializeError> {
    envelope
        .payload
        .as_ref()
        .and_then(|payload| encoding::payload_text(payload, &["member_did", "memberDID"]))
        .map(str::to_string)
        .ok_or(MaterializeError::MissingMemberDid)
}

/// Rebuild a jar's membership view by replaying its full receipt log in
/// sequence order. Per-receipt materialization failures are logged and
/// skipped, matching live behavior.
pub fn rebuild_members(storage: &Storage, jar_id: &str) -> Result<usize, ApiError> {
    storage.clear_members(jar_id)?;
    let mut applied = 0;
    let mut after = 0;
    loop {
        let batch = storage.receipts_after(jar_id, after, MAX_BACKFILL_LIMIT)?;
        if batch.is_empty() {
            break;
        }
        for row in &batch {
            after = row.sequence_number;
            match encoding::decode_receipt(&row.receipt_data) {
                Ok(envelope) => {
                    if let Err(e) = materialize(storage, jar_id, &row.receipt_cid, &envelope) {
                        rlog!(
                            Warn,
                            "receipts: replay of seq {} in {} skipped: {e}",
                            row.sequence_number,
                            logging::short_id(jar_id)
                        );
                    } else {
                        applied += 1;
                    }
                }
                Err(e) => {
                    rlog!(
                        Warn,
                        "receipts: replay of seq {} in {} undecodable: {e}",
                        row.sequence_number,
                        logging::short_id(jar_id)
                    );
                }
            }
        }
    }
    Ok(applied)
}

/// Backfill query: either everything after a sequence number, or an
/// inclusive range.
pub enum BackfillQuery {
    After { after: i64, limit: u32 },
    Range { from: i64, to: i64 },
}

/// Fetch receipt envelopes for a jar. The caller must be an active member.
pub fn get_receipts(
    storage: &Storage,
    caller_did: &str,
    jar_id: &str,
    query: BackfillQuery,
) -> Result<Vec<ReceiptRow>, ApiError> {
    if !storage.is_active_member(jar_id, caller_did)? {
        return Err(ApiError::Forbidden(
            "caller is not a member of this jar".to_string(),
        ));
    }
    match query {
        BackfillQuery::After { after, limit } => {
            let limit = limit.min(MAX_BACKFILL_LIMIT);
            Ok(storage.receipts_after(jar_id, after, limit)?)
        }
        BackfillQuery::Range { from, to } => {
            if from > to {
                return Err(ApiError::validation("from must not exceed to"));
            }
            Ok(storage.receipts_range(jar_id, from, to)?)
        }
    }
}

/// Every jar the caller is an active member of, with their role.
pub fn list_jars(storage: &Storage, caller_did: &str) -> Result<Vec<(String, String)>, ApiError> {
    Ok(storage.list_jars_for(caller_did)?)
}
