//! Silent push notification fan-out.
//!
//! When a message lands, every active device of the recipient set that has a
//! push token gets a fixed wakeup payload. The payload deliberately carries
//! no sender identity, no count, nothing the push provider could correlate —
//! only `content-available` and the inbox marker.
//!
//! Push is best-effort: delivery runs as a detached task after the send
//! response, failures are logged and never fail the send. A 410 from the
//! provider means the token is dead; the device is marked inactive and its
//! token dropped.

use std::fmt;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::json;

use crate::logging::now_ms;
use crate::rlog;
use crate::web::state::SharedState;

/// The one and only push body. Any identity or count hint here would leak
/// metadata to the push provider.
pub const SILENT_PAYLOAD: &[u8] = br#"{"aps":{"content-available":1},"inbox":1}"#;

/// Effective life of a cached provider bearer token.
const TOKEN_TTL_MS: i64 = 15 * 60 * 1000;

#[derive(Debug)]
pub enum PushError {
    Config(&'static str),
    Mint(String),
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Config(what) => write!(f, "push config error: {what}"),
            PushError::Mint(detail) => write!(f, "token mint error: {detail}"),
        }
    }
}

impl std::error::Error for PushError {}

/// Outcome of one delivery attempt, mapped from the provider's status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// 410: the device token is gone for good.
    TokenInvalid,
    /// 429 from the provider.
    RateLimited,
    /// 5xx from the provider.
    ServerError(u16),
    /// Transport-level failure.
    Failed(String),
}

/// Mints short-lived bearer tokens for the provider connection.
pub trait TokenMinter: Send + Sync {
    fn mint(&self) -> Result<String, PushError>;
}

/// Provider transport seam. Implementations post one notification to one
/// device token and report the outcome; they must not panic on provider
/// errors.
pub trait PushProvider: Send + Sync {
    fn deliver(&self, device_token: &str, bearer: &str, payload: &[u8]) -> PushOutcome;
}

/// EdDSA JWT minter over the configured signing key.
///
/// Header `{"alg":"EdDSA","kid":…}`, claims `{"iss":team_id,"iat":…}`,
/// signature over `header.claims`, all base64url unpadded.
pub struct JwtMinter {
    signing_key: SigningKey,
    key_id: String,
    team_id: String,
}

impl JwtMinter {
    pub fn new(key_base64: &str, key_id: &str, team_id: &str) -> Result<Self, PushError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|_| PushError::Config("push key is not valid base64"))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PushError::Config("push key must be 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
            key_id: key_id.to_string(),
            team_id: team_id.to_string(),
        })
    }
}

impl TokenMinter for JwtMinter {
    fn mint(&self) -> Result<String, PushError> {
        let header = json!({"alg": "EdDSA", "typ": "JWT", "kid": self.key_id});
        let claims = json!({"iss": self.team_id, "iat": now_ms() / 1000});
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string()),
        );
        let signature = self.signing_key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// HTTP push gateway client posting to the provider's per-device path.
pub struct HttpPushProvider {
    base_url: String,
    topic: String,
}

impl HttpPushProvider {
    pub fn new(base_url: &str, topic: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            topic: topic.to_string(),
        }
    }
}

impl PushProvider for HttpPushProvider {
    fn deliver(&self, device_token: &str, bearer: &str, payload: &[u8]) -> PushOutcome {
        let url = format!("{}/3/device/{}", self.base_url, device_token);
        let response = ureq::post(&url)
            .set("authorization", &format!("bearer {bearer}"))
            .set("apns-topic", &self.topic)
            .set("apns-push-type", "background")
            .set("apns-priority", "5")
            .set("content-type", "application/json")
            .send_bytes(payload);
        match response {
            Ok(_) => PushOutcome::Delivered,
            Err(ureq::Error::Status(410, _)) => PushOutcome::TokenInvalid,
            Err(ureq::Error::Status(429, _)) => PushOutcome::RateLimited,
            Err(ureq::Error::Status(code, _)) if (500..600).contains(&code) => {
                PushOutcome::ServerError(code)
            }
            Err(ureq::Error::Status(code, _)) => {
                PushOutcome::Failed(format!("provider status {code}"))
            }
            Err(e) => PushOutcome::Failed(e.to_string()),
        }
    }
}

struct CachedToken {
    bearer: String,
    minted_at: i64,
}

/// Push service: provider transport plus the process-cached bearer token.
pub struct PushService {
    provider: Arc<dyn PushProvider>,
    minter: Box<dyn TokenMinter>,
    cached: Mutex<Option<CachedToken>>,
}

impl PushService {
    pub fn new(provider: Arc<dyn PushProvider>, minter: Box<dyn TokenMinter>) -> Self {
        Self {
            provider,
            minter,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, re-minted once the cached one passes its
    /// effective life.
    fn bearer(&self) -> Result<String, PushError> {
        let mut cached = self.cached.lock().unwrap();
        let now = now_ms();
        if let Some(token) = cached.as_ref() {
            if now - token.minted_at < TOKEN_TTL_MS {
                return Ok(token.bearer.clone());
            }
        }
        let bearer = self.minter.mint()?;
        *cached = Some(CachedToken {
            bearer: bearer.clone(),
            minted_at: now,
        });
        Ok(bearer)
    }

    fn deliver(&self, device_token: &str) -> PushOutcome {
        match self.bearer() {
            Ok(bearer) => self.provider.deliver(device_token, &bearer, SILENT_PAYLOAD),
            Err(e) => PushOutcome::Failed(e.to_string()),
        }
    }
}

/// Detached fan-out task: resolve push targets for the recipient set and
/// dispatch to all of them in parallel. Spawned after the send response;
/// never inherits the request's cancellation.
pub async fn fan_out(state: SharedState, recipient_dids: Vec<String>) {
    let (service, targets) = {
        let st = state.lock().await;
        let Some(service) = st.push.clone() else {
            return;
        };
        let targets = match st.storage.active_push_targets(&recipient_dids) {
            Ok(targets) => targets,
            Err(e) => {
                rlog!(Warn, "push: target lookup failed: {e}");
                return;
            }
        };
        (service, targets)
    };
    if targets.is_empty() {
        return;
    }

    let mut handles = Vec::with_capacity(targets.len());
    for (device_id, push_token) in targets {
        let service = Arc::clone(&service);
        handles.push(tokio::task::spawn_blocking(move || {
            let outcome = service.deliver(&push_token);
            (device_id, outcome)
        }));
    }

    let mut dead_devices = Vec::new();
    for handle in handles {
        let Ok((device_id, outcome)) = handle.await else {
            continue;
        };
        match outcome {
            PushOutcome::Delivered => {}
            PushOutcome::TokenInvalid => {
                rlog!(
                    Info,
                    "push: token gone, deactivating device {}",
                    crate::logging::short_id(&device_id)
                );
                dead_devices.push(device_id);
            }
            PushOutcome::RateLimited => {
                rlog!(Warn, "push: provider rate limited delivery to {device_id}");
            }
            PushOutcome::ServerError(code) => {
                rlog!(Warn, "push: provider error {code} for {device_id}");
            }
            PushOutcome::Failed(detail) => {
                rlog!(Warn, "push: delivery to {device_id} failed: {detail}");
            }
        }
    }

    if !dead_devices.is_empty() {
        let st = state.lock().await;
        for device_id in dead_devices {
            if let Err(e) = st.storage.deactivate_device(&device_id) {
                rlog!(Warn, "push: failed to deactivate {device_id}: {e}");
            }
        }
    }
}
