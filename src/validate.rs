//! Request field validation.
//!
//! Every identifier that reaches storage goes through one of these checks
//! first. Validators return a human-readable message naming the offending
//! field; handlers accumulate them into the `VALIDATION_ERROR` detail list.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use uuid::Uuid;

pub const MAX_RECIPIENTS: usize = 12;
pub const MAX_BATCH_PHONES: usize = 12;

const DID_PHONE_PREFIX: &str = "did:phone:";
const DID_BUDS_PREFIX: &str = "did:buds:";
const MAX_BUDS_ID_LEN: usize = 44;

/// Bitcoin-style base58: no `0`, `O`, `I`, `l`.
fn is_base58_char(c: char) -> bool {
    matches!(c, '1'..='9' | 'A'..='H' | 'J'..='N' | 'P'..='Z' | 'a'..='k' | 'm'..='z')
}

/// A DID is `did:phone:` + 64 lowercase hex chars, or the legacy
/// `did:buds:` + 1–44 base58 chars.
pub fn validate_did(field: &str, value: &str) -> Result<(), String> {
    if let Some(id) = value.strip_prefix(DID_PHONE_PREFIX) {
        if id.len() == 64 && id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Ok(());
        }
        return Err(format!("{field} must be did:phone: followed by 64 lowercase hex chars"));
    }
    if let Some(id) = value.strip_prefix(DID_BUDS_PREFIX) {
        if !id.is_empty() && id.len() <= MAX_BUDS_ID_LEN && id.chars().all(is_base58_char) {
            return Ok(());
        }
        return Err(format!("{field} must be did:buds: followed by 1-44 base58 chars"));
    }
    Err(format!("{field} is not a recognized DID"))
}

/// Device and message ids are UUIDv4.
pub fn validate_uuid(field: &str, value: &str) -> Result<(), String> {
    match Uuid::parse_str(value) {
        Ok(uuid) if uuid.get_version() == Some(uuid::Version::Random) => Ok(()),
        _ => Err(format!("{field} must be a UUIDv4")),
    }
}

/// Decode base64 with the standard alphabet, padding optional.
pub fn decode_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if value.contains('=') {
        STANDARD.decode(value)
    } else {
        STANDARD_NO_PAD.decode(value)
    }
}

/// Non-empty standard-alphabet base64 with optional padding.
pub fn validate_base64(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    decode_base64(value)
        .map(|_| ())
        .map_err(|_| format!("{field} is not valid base64"))
}

/// Base64-encoded Ed25519 signature: decodes to exactly 64 bytes.
pub fn validate_signature(field: &str, value: &str) -> Result<Vec<u8>, String> {
    if !(86..=88).contains(&value.len()) {
        return Err(format!("{field} must be a base64 ed25519 signature"));
    }
    let bytes =
        decode_base64(value).map_err(|_| format!("{field} is not valid base64"))?;
    if bytes.len() != 64 {
        return Err(format!("{field} must decode to 64 bytes"));
    }
    Ok(bytes)
}

/// CIDv1 string: literal `b` prefix + 50–60 lowercase base32 chars.
pub fn validate_cid(field: &str, value: &str) -> Result<(), String> {
    let Some(body) = value.strip_prefix('b') else {
        return Err(format!("{field} must start with the multibase prefix b"));
    };
    if (50..=60).contains(&body.len())
        && body.chars().all(|c| matches!(c, 'a'..='z' | '2'..='7'))
    {
        Ok(())
    } else {
        Err(format!("{field} must be 50-60 lowercase base32 chars"))
    }
}

/// E.164 phone number: `+`, then a non-zero digit, then up to 14 digits.
pub fn validate_phone(field: &str, value: &str) -> Result<(), String> {
    let Some(digits) = value.strip_prefix('+') else {
        return Err(format!("{field} must start with +"));
    };
    let ok = !digits.is_empty()
        && digits.len() <= 15
        && digits.starts_with(|c: char| ('1'..='9').contains(&c))
        && digits.chars().all(|c| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(format!("{field} must be an E.164 phone number"))
    }
}

/// Recipient list: 1–12 valid DIDs.
pub fn validate_recipients(field: &str, recipients: &[String]) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();
    if recipients.is_empty() {
        problems.push(format!("{field} must contain at least one DID"));
    }
    if recipients.len() > MAX_RECIPIENTS {
        problems.push(format!("{field} must contain at most {MAX_RECIPIENTS} DIDs"));
    } else {
        for (i, did) in recipients.iter().enumerate() {
            if let Err(message) = validate_did(&format!("{field}[{i}]"), did) {
                problems.push(message);
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_accepts_both_forms() {
        let hex64 = "a".repeat(64);
        assert!(validate_did("did", &format!("did:phone:{hex64}")).is_ok());
        assert!(validate_did("did", "did:buds:5dGHK7P9mNqR8vZw3T").is_ok());
    }

    #[test]
    fn did_rejects_malformed_forms() {
        assert!(validate_did("did", "did:buds:").is_err());
        assert!(validate_did("did", "did:web:example.com").is_err());
        assert!(validate_did("did", "did:buds:abc!@#").is_err());
        assert!(validate_did("did", &format!("did:buds:{}", "a".repeat(100))).is_err());
        assert!(validate_did("did", "did:buds:abc--comment").is_err());
        // Upper-case hex and short hex both fail the phone form.
        assert!(validate_did("did", &format!("did:phone:{}", "A".repeat(64))).is_err());
        assert!(validate_did("did", "did:phone:abc123").is_err());
        // base58 excludes 0, O, I, l
        assert!(validate_did("did", "did:buds:0OIl").is_err());
    }

    #[test]
    fn uuid_must_be_v4() {
        assert!(validate_uuid("id", "4fd1c6a2-9f0b-4f4e-8e8a-1c2d3e4f5a6b").is_ok());
        // v1 UUID
        assert!(validate_uuid("id", "c232ab00-9414-11ec-b3c8-9f6bdeced846").is_err());
        assert!(validate_uuid("id", "not-a-uuid").is_err());
    }

    #[test]
    fn base64_padding_is_optional() {
        assert!(validate_base64("p", "aGVsbG8=").is_ok());
        assert!(validate_base64("p", "aGVsbG8").is_ok());
        assert!(validate_base64("p", "").is_err());
        assert!(validate_base64("p", "a b c").is_err());
        // URL-safe alphabet is not accepted on this surface.
        assert!(validate_base64("p", "-_-_").is_err());
    }

    #[test]
    fn signature_length_is_enforced() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let sig64 = STANDARD.encode([0u8; 64]);
        assert_eq!(validate_signature("sig", &sig64).unwrap().len(), 64);
        let sig63 = STANDARD.encode([0u8; 63]);
        assert!(validate_signature("sig", &sig63).is_err());
        assert!(validate_signature("sig", "short").is_err());
    }

    #[test]
    fn cid_shape_is_enforced() {
        let cid = crate::encoding::compute_cid(b"x");
        assert!(validate_cid("cid", &cid).is_ok());
        assert!(validate_cid("cid", &cid[1..]).is_err());
        assert!(validate_cid("cid", "bUPPERCASE").is_err());
        assert!(validate_cid("cid", &format!("b{}", "a".repeat(10))).is_err());
        assert!(validate_cid("cid", &format!("b{}", "a".repeat(61))).is_err());
    }

    #[test]
    fn phone_is_e164() {
        assert!(validate_phone("phone", "+14155551234").is_ok());
        assert!(validate_phone("phone", "+1").is_ok());
        assert!(validate_phone("phone", "14155551234").is_err());
        assert!(validate_phone("phone", "+04155551234").is_err());
        assert!(validate_phone("phone", "+1415555123456789").is_err());
        assert!(validate_phone("phone", "+1415abc").is_err());
        assert!(validate_phone("phone", "+").is_err());
    }

    #[test]
    fn recipient_list_bounds() {
        let did = format!("did:phone:{}", "b".repeat(64));
        assert!(validate_recipients("recipients", &[did.clone()]).is_ok());
        assert!(validate_recipients("recipients", &[]).is_err());
        let thirteen = vec![did.clone(); 13];
        assert!(validate_recipients("recipients", &thirteen).is_err());
        let bad = vec!["did:web:x".to_string()];
        let problems = validate_recipients("recipients", &bad).unwrap_err();
        assert_eq!(problems.len(), 1);
    }
}
