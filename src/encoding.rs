//! Canonical byte encodings for content addressing and receipt parsing.
//!
//! Receipts are content-addressed by CIDv1: a fixed `0x01` version byte, the
//! dag-cbor codec `0x71`, the sha2-256 multihash prefix `0x12 0x20`, and the
//! SHA-256 digest of the receipt bytes, all base32-encoded (lowercase,
//! unpadded) behind a literal `b` prefix. The prefix bytes are constants of
//! the format; nothing is ever inferred from the input.

use std::fmt;

use ciborium::value::Value;
use sha2::{Digest, Sha256};

/// Lowercase RFC 4648 alphabet used by base32 CID strings.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// CIDv1 header: version 1, dag-cbor codec, sha2-256 multihash of 32 bytes.
const CID_PREFIX: [u8; 4] = [0x01, 0x71, 0x12, 0x20];

/// Multibase prefix for lowercase base32.
const MULTIBASE_BASE32: char = 'b';

const DID_PHONE_PREFIX: &str = "did:phone:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptDecodeError {
    /// The bytes are not a CBOR map.
    NotAMap,
    /// A required field is absent.
    MissingField(&'static str),
    /// A field is present but has the wrong CBOR type or shape.
    BadField(&'static str),
    /// The CBOR stream itself is malformed.
    Cbor(String),
}

impl fmt::Display for ReceiptDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiptDecodeError::NotAMap => write!(f, "receipt is not a cbor map"),
            ReceiptDecodeError::MissingField(name) => write!(f, "missing field: {name}"),
            ReceiptDecodeError::BadField(name) => write!(f, "ill-formed field: {name}"),
            ReceiptDecodeError::Cbor(detail) => write!(f, "cbor decode error: {detail}"),
        }
    }
}

impl std::error::Error for ReceiptDecodeError {}

/// Encode bytes as lowercase unpadded base32.
///
/// Bits are accumulated into a 40-bit buffer and emitted as 5-bit indices
/// MSB-first; a trailing partial group is left-shifted up to 5 bits.
pub fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits: u32 = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = ((buffer >> bits) & 0x1f) as usize;
            out.push(BASE32_ALPHABET[index] as char);
        }
    }
    if bits > 0 {
        let index = ((buffer << (5 - bits)) & 0x1f) as usize;
        out.push(BASE32_ALPHABET[index] as char);
    }
    out
}

/// Compute the CIDv1 string for a byte string.
pub fn compute_cid(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut raw = Vec::with_capacity(CID_PREFIX.len() + digest.len());
    raw.extend_from_slice(&CID_PREFIX);
    raw.extend_from_slice(&digest);

    let mut cid = String::with_capacity(59);
    cid.push(MULTIBASE_BASE32);
    cid.push_str(&base32_encode(&raw));
    cid
}

/// Recompute the CID of `bytes` and compare against `claimed` for exact
/// equality.
pub fn verify_cid(claimed: &str, bytes: &[u8]) -> bool {
    compute_cid(bytes) == claimed
}

/// The typed envelope fields of a jar receipt.
///
/// Only the fields the relay needs for sequencing and membership are decoded;
/// the payload map stays an opaque [`Value`] whose shape depends on
/// `receipt_type`.
#[derive(Debug, Clone)]
pub struct ReceiptEnvelope {
    pub receipt_type: String,
    pub sender_did: String,
    /// Milliseconds since epoch, already narrowed to i64 for SQL binding.
    pub timestamp: i64,
    pub parent_cid: Option<String>,
    pub payload: Option<Value>,
}

fn decode_map(bytes: &[u8]) -> Result<Vec<(Value, Value)>, ReceiptDecodeError> {
    let value: Value = ciborium::de::from_reader(bytes)
        .map_err(|e| ReceiptDecodeError::Cbor(e.to_string()))?;
    match value {
        Value::Map(entries) => Ok(entries),
        _ => Err(ReceiptDecodeError::NotAMap),
    }
}

fn map_get<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries.iter().find_map(|(k, v)| match k {
        Value::Text(text) if text == key => Some(v),
        _ => None,
    })
}

fn require_text(
    entries: &[(Value, Value)],
    key: &'static str,
) -> Result<String, ReceiptDecodeError> {
    match map_get(entries, key) {
        Some(Value::Text(text)) => Ok(text.clone()),
        Some(_) => Err(ReceiptDecodeError::BadField(key)),
        None => Err(ReceiptDecodeError::MissingField(key)),
    }
}

/// Targeted decoder: pull `sender_did` out of raw receipt bytes.
///
/// This runs before any signature check (it determines which key to verify
/// with), so it must tolerate otherwise-hostile input and trust nothing
/// beyond the map shape. Receipts are written by salt-derived identities, so
/// the sender must carry the `did:phone:` prefix.
pub fn extract_sender_did(bytes: &[u8]) -> Result<String, ReceiptDecodeError> {
    let entries = decode_map(bytes)?;
    let sender_did = require_text(&entries, "sender_did")?;
    if !sender_did.starts_with(DID_PHONE_PREFIX) {
        return Err(ReceiptDecodeError::BadField("sender_did"));
    }
    Ok(sender_did)
}

/// Decode the full typed envelope of a receipt.
///
/// CBOR integers may arrive with arbitrary precision; the timestamp is
/// narrowed to i64 here because the database layer rejects anything wider.
pub fn decode_receipt(bytes: &[u8]) -> Result<ReceiptEnvelope, ReceiptDecodeError> {
    let entries = decode_map(bytes)?;

    let receipt_type = require_text(&entries, "receipt_type")?;
    let sender_did = require_text(&entries, "sender_did")?;
    if !sender_did.starts_with(DID_PHONE_PREFIX) {
        return Err(ReceiptDecodeError::BadField("sender_did"));
    }

    let timestamp = match map_get(&entries, "timestamp") {
        Some(Value::Integer(raw)) => {
            i64::try_from(*raw).map_err(|_| ReceiptDecodeError::BadField("timestamp"))?
        }
        Some(_) => return Err(ReceiptDecodeError::BadField("timestamp")),
        None => return Err(ReceiptDecodeError::MissingField("timestamp")),
    };
    if timestamp < 0 {
        return Err(ReceiptDecodeError::BadField("timestamp"));
    }

    let parent_cid = match map_get(&entries, "parent_cid") {
        Some(Value::Text(text)) => Some(text.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(ReceiptDecodeError::BadField("parent_cid")),
    };

    let payload = match map_get(&entries, "payload") {
        Some(value @ Value::Map(_)) => Some(value.clone()),
        Some(Value::Null) | None => None,
        Some(_) => return Err(ReceiptDecodeError::BadField("payload")),
    };

    Ok(ReceiptEnvelope {
        receipt_type,
        sender_did,
        timestamp,
        parent_cid,
        payload,
    })
}

/// Read a text field out of a decoded payload map, trying each key in order.
///
/// Member receipts have historically spelled the member field both
/// `member_did` and `memberDID`; both are accepted.
pub fn payload_text<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    let Value::Map(entries) = payload else {
        return None;
    };
    for key in keys {
        if let Some(Value::Text(text)) = map_get(entries, key) {
            return Some(text);
        }
    }
    None
}
