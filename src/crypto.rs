//! Phone-number encryption and receipt signature verification.
//!
//! The phone cipher is a searchable-encryption construction: deterministic
//! AES-256-GCM with the nonce derived from the plaintext (first 12 bytes of
//! SHA-256(phone)). Equal phones produce equal ciphertexts, which is the
//! point — the ciphertext is an equality-lookup key for database columns.
//! It is NOT semantically secure and must never be used for higher-entropy
//! data. Decryption is deliberately not offered.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

pub const PHONE_KEY_SIZE: usize = 32;
pub const SALT_SIZE: usize = 32;
const PHONE_NONCE_SIZE: usize = 12;

#[derive(Debug)]
pub enum CryptoError {
    InvalidLength(&'static str),
    InvalidBase64(&'static str),
    Aead,
    InvalidSignature,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidLength(message) => write!(f, "invalid length: {message}"),
            CryptoError::InvalidBase64(field) => write!(f, "invalid base64: {field}"),
            CryptoError::Aead => write!(f, "aead failure"),
            CryptoError::InvalidSignature => write!(f, "invalid signature"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Deterministic AEAD over phone numbers, keyed once per process.
#[derive(Clone)]
pub struct PhoneCipher {
    key: [u8; PHONE_KEY_SIZE],
}

impl PhoneCipher {
    /// Build a cipher from raw key bytes.
    pub fn new(key: [u8; PHONE_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Build a cipher from the base64 key material held in configuration.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::InvalidBase64("phone key"))?;
        let key: [u8; PHONE_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidLength("phone key must be 32 bytes"))?;
        Ok(Self::new(key))
    }

    /// Deterministically encrypt a phone number for storage and lookup.
    ///
    /// Returns base64 of ciphertext plus the 16-byte GCM tag. For a fixed key
    /// this is a pure function of the phone number.
    pub fn encrypt_phone(&self, phone: &str) -> Result<String, CryptoError> {
        let digest = Sha256::digest(phone.as_bytes());
        let nonce_bytes = &digest[..PHONE_NONCE_SIZE];

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(nonce_bytes), phone.as_bytes())
            .map_err(|_| CryptoError::Aead)?;
        Ok(STANDARD.encode(ciphertext))
    }
}

/// Generate a fresh 32-byte account salt, base64-encoded for storage.
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    STANDARD.encode(salt)
}

/// Decode a stored base64 Ed25519 public key into a verifying key.
pub fn decode_verifying_key(public_key_base64: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = STANDARD
        .decode(public_key_base64)
        .map_err(|_| CryptoError::InvalidBase64("public key"))?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidLength("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidSignature)
}

/// Verify an Ed25519 signature over the exact message bytes.
///
/// Receipts are signed over the raw `receipt_data` bytes as transmitted; no
/// re-canonicalization happens on either side.
pub fn verify_signature(
    public_key_base64: &str,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key = decode_verifying_key(public_key_base64)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidLength("signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn test_cipher() -> PhoneCipher {
        PhoneCipher::new([7u8; PHONE_KEY_SIZE])
    }

    #[test]
    fn phone_encryption_is_deterministic() {
        let cipher = test_cipher();
        let a1 = cipher.encrypt_phone("+14155551234").unwrap();
        let a2 = cipher.encrypt_phone("+14155551234").unwrap();
        let b = cipher.encrypt_phone("+14155551235").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn distinct_keys_produce_distinct_ciphertexts() {
        let a = PhoneCipher::new([1u8; PHONE_KEY_SIZE])
            .encrypt_phone("+14155551234")
            .unwrap();
        let b = PhoneCipher::new([2u8; PHONE_KEY_SIZE])
            .encrypt_phone("+14155551234")
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn from_base64_round_trips_and_rejects_short_keys() {
        let encoded = STANDARD.encode([9u8; PHONE_KEY_SIZE]);
        let cipher = PhoneCipher::from_base64(&encoded).unwrap();
        assert_eq!(
            cipher.encrypt_phone("+15550001111").unwrap(),
            PhoneCipher::new([9u8; PHONE_KEY_SIZE])
                .encrypt_phone("+15550001111")
                .unwrap()
        );

        assert!(PhoneCipher::from_base64(&STANDARD.encode([0u8; 16])).is_err());
        assert!(PhoneCipher::from_base64("not base64 !!!").is_err());
    }

    #[test]
    fn salt_is_32_bytes_of_base64() {
        let salt = generate_salt();
        assert_eq!(salt.len(), 44);
        assert_eq!(STANDARD.decode(&salt).unwrap().len(), SALT_SIZE);
        assert_ne!(generate_salt(), salt);
    }

    #[test]
    fn signature_verification_accepts_valid_and_rejects_tampered() {
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let signing_key = SigningKey::generate(&mut rng);
        let public_b64 = STANDARD.encode(signing_key.verifying_key().to_bytes());

        let message = b"receipt bytes exactly as transmitted";
        let signature = signing_key.sign(message).to_bytes();

        assert!(verify_signature(&public_b64, message, &signature).is_ok());
        assert!(verify_signature(&public_b64, b"different bytes", &signature).is_err());

        let mut bad_sig = signature;
        bad_sig[0] ^= 1;
        assert!(verify_signature(&public_b64, message, &bad_sig).is_err());

        let other_key = SigningKey::generate(&mut ChaCha20Rng::from_seed([4u8; 32]));
        let other_b64 = STANDARD.encode(other_key.verifying_key().to_bytes());
        assert!(verify_signature(&other_b64, message, &signature).is_err());
    }

    #[test]
    fn verify_rejects_malformed_key_material() {
        assert!(matches!(
            verify_signature("@@@", b"m", &[0u8; 64]),
            Err(CryptoError::InvalidBase64(_))
        ));
        let short_key = STANDARD.encode([0u8; 16]);
        assert!(matches!(
            verify_signature(&short_key, b"m", &[0u8; 64]),
            Err(CryptoError::InvalidLength(_))
        ));
        let ok_key = STANDARD.encode([0u8; 32]);
        assert!(verify_signature(&ok_key, b"m", &[0u8; 63]).is_err());
    }
}
