//! Identity operations: account salts, phone→DID lookup, device registry.
//!
//! Every phone number is encrypted with the process-wide [`PhoneCipher`]
//! before it touches a query or a row; plaintext phones exist only inside a
//! request. DIDs are derived client-side as `did:phone:` ∥
//! hex(SHA-256(phone ∥ salt)) — the relay stores them for indexing and never
//! recomputes them.

use std::collections::HashMap;

use crate::crypto::{generate_salt, PhoneCipher};
use crate::error::ApiError;
use crate::storage::{DeviceRow, Storage, DEVICE_STATUS_ACTIVE, DEVICE_STATUS_INACTIVE};

/// Active devices one DID may hold before registration of new device ids is
/// refused.
pub const MAX_DEVICES_PER_DID: i64 = 10;

pub struct SaltResult {
    pub salt: String,
    pub created: bool,
}

/// Return the account salt for a phone, generating and persisting a fresh
/// 32-byte one on first sight.
///
/// Safe under concurrent first-time calls: the insert is insert-or-ignore on
/// the encrypted-phone primary key, and every caller re-reads the winning
/// row, so all observers agree on one salt forever after.
pub fn get_or_create_salt(
    storage: &Storage,
    cipher: &PhoneCipher,
    phone: &str,
) -> Result<SaltResult, ApiError> {
    let encrypted_phone = cipher
        .encrypt_phone(phone)
        .map_err(|e| ApiError::Internal(format!("phone encryption: {e}")))?;

    if let Some(salt) = storage.get_salt(&encrypted_phone)? {
        return Ok(SaltResult { salt, created: false });
    }

    let fresh = generate_salt();
    let created = storage.insert_salt_if_absent(&encrypted_phone, &fresh, crate::logging::now_ms())?;
    let salt = storage
        .get_salt(&encrypted_phone)?
        .ok_or_else(|| ApiError::Internal("salt vanished after insert".to_string()))?;
    Ok(SaltResult { salt, created })
}

/// Resolve a phone number to its DID. 404 when no mapping exists.
pub fn lookup_did(
    storage: &Storage,
    cipher: &PhoneCipher,
    phone: &str,
) -> Result<String, ApiError> {
    let encrypted_phone = cipher
        .encrypt_phone(phone)
        .map_err(|e| ApiError::Internal(format!("phone encryption: {e}")))?;
    storage
        .get_did(&encrypted_phone)?
        .ok_or_else(|| ApiError::NotFound("did mapping".to_string()))
}

/// Resolve up to 12 phones in one query. Unknown phones are absent from the
/// result rather than errors.
pub fn batch_lookup_did(
    storage: &Storage,
    cipher: &PhoneCipher,
    phones: &[String],
) -> Result<HashMap<String, String>, ApiError> {
    let mut by_encrypted: HashMap<String, &str> = HashMap::with_capacity(phones.len());
    let mut encrypted_phones = Vec::with_capacity(phones.len());
    for phone in phones {
        let encrypted = cipher
            .encrypt_phone(phone)
            .map_err(|e| ApiError::Internal(format!("phone encryption: {e}")))?;
        by_encrypted.insert(encrypted.clone(), phone);
        encrypted_phones.push(encrypted);
    }

    let mut result = HashMap::new();
    for (encrypted, did) in storage.get_dids(&encrypted_phones)? {
        if let Some(phone) = by_encrypted.get(&encrypted) {
            result.insert((*phone).to_string(), did);
        }
    }
    Ok(result)
}

pub struct RegisterDeviceInput {
    pub device_id: String,
    pub device_name: String,
    pub owner_did: String,
    pub phone: String,
    pub pubkey_x25519: String,
    pub pubkey_ed25519: String,
    pub push_token: Option<String>,
}

/// Register a device, or re-register an existing one (key rotation / push
/// token refresh). Re-registration overwrites keys and push token but keeps
/// the original registered_at. Also upserts the phone→DID mapping. The bool
/// is true when the device id was new.
pub fn register_device(
    storage: &Storage,
    cipher: &PhoneCipher,
    caller_phone: &str,
    input: RegisterDeviceInput,
    now: i64,
) -> Result<(DeviceRow, bool), ApiError> {
    if caller_phone != input.phone {
        return Err(ApiError::Forbidden(
            "phone does not match authenticated caller".to_string(),
        ));
    }
    let encrypted_phone = cipher
        .encrypt_phone(&input.phone)
        .map_err(|e| ApiError::Internal(format!("phone encryption: {e}")))?;

    let existing = storage.get_device(&input.device_id)?;
    if let Some(existing) = &existing {
        if existing.owner_did != input.owner_did {
            return Err(ApiError::Forbidden(
                "device is registered to another identity".to_string(),
            ));
        }
    } else if storage.count_active_devices(&input.owner_did)? >= MAX_DEVICES_PER_DID {
        return Err(ApiError::DeviceLimitExceeded);
    }

    let created = existing.is_none();
    let row = DeviceRow {
        device_id: input.device_id,
        owner_did: input.owner_did.clone(),
        owner_encrypted_phone: encrypted_phone.clone(),
        device_name: input.device_name,
        pubkey_x25519: input.pubkey_x25519,
        pubkey_ed25519: input.pubkey_ed25519,
        push_token: input.push_token,
        status: DEVICE_STATUS_ACTIVE.to_string(),
        registered_at: existing.as_ref().map_or(now, |d| d.registered_at),
        last_seen_at: now,
    };
    storage.upsert_device(&row)?;
    storage.upsert_phone_did(&encrypted_phone, &input.owner_did, now)?;
    Ok((row, created))
}

/// Update a device's last_seen_at. 404 when the device is absent or
/// inactive; 403 when the device belongs to someone else's phone.
pub fn heartbeat(
    storage: &Storage,
    cipher: &PhoneCipher,
    caller_phone: &str,
    device_id: &str,
    now: i64,
) -> Result<i64, ApiError> {
    let device = storage
        .get_device(device_id)?
        .ok_or_else(|| ApiError::NotFound("device".to_string()))?;
    if device.status == DEVICE_STATUS_INACTIVE {
        return Err(ApiError::NotFound("device".to_string()));
    }

    let encrypted_phone = cipher
        .encrypt_phone(caller_phone)
        .map_err(|e| ApiError::Internal(format!("phone encryption: {e}")))?;
    if device.owner_encrypted_phone != encrypted_phone {
        return Err(ApiError::Forbidden(
            "device is registered to another identity".to_string(),
        ));
    }

    storage.touch_device(device_id, now)?;
    Ok(now)
}

/// Active devices for up to 12 DIDs, for key discovery between contacts.
pub fn list_devices(storage: &Storage, dids: &[String]) -> Result<Vec<DeviceRow>, ApiError> {
    Ok(storage.list_active_devices(dids)?)
}
