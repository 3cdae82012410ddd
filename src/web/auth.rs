//! Caller authentication and per-request middleware.
//!
//! Token verification belongs to an external auth service; this module holds
//! the seam ([`AuthVerifier`]) and the signed-token reference implementation
//! the service issues against. A verified token yields the caller's phone
//! number; the middleware additionally resolves the caller's DID (when the
//! phone has a mapping) so rate limiting can key on it.
//!
//! Token format: `base64url(phone) . unix_seconds . base64url(signature)`
//! where the signature is Ed25519 by the auth service over
//! `"buds-caller-auth\n{phone}\n{timestamp}"`. Tokens drift at most ±300 s.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::ratelimit::{Decision, RateLimitPolicy, DEFAULT_POLICY};
use crate::rlog_kv;
use crate::web::state::SharedState;

const AUTH_CONTEXT: &str = "buds-caller-auth";
const MAX_TOKEN_DRIFT_SECS: i64 = 300;

/// Verifies a bearer token into the caller's phone number.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str, now_secs: i64) -> Result<String, ApiError>;
}

/// Reference verifier: checks the auth service's Ed25519 signature.
pub struct SignedTokenVerifier {
    service_key: VerifyingKey,
}

impl SignedTokenVerifier {
    pub fn from_base64(public_key_base64: &str) -> Result<Self, String> {
        let service_key = crate::crypto::decode_verifying_key(public_key_base64.trim())
            .map_err(|e| format!("auth public key: {e}"))?;
        Ok(Self { service_key })
    }
}

impl AuthVerifier for SignedTokenVerifier {
    fn verify(&self, token: &str, now_secs: i64) -> Result<String, ApiError> {
        let mut parts = token.splitn(3, '.');
        let (Some(phone_b64), Some(ts_str), Some(sig_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ApiError::AuthFailed);
        };

        let phone_bytes = URL_SAFE_NO_PAD
            .decode(phone_b64)
            .map_err(|_| ApiError::AuthFailed)?;
        let phone = String::from_utf8(phone_bytes).map_err(|_| ApiError::AuthFailed)?;

        let timestamp: i64 = ts_str.parse().map_err(|_| ApiError::AuthFailed)?;
        if (now_secs - timestamp).abs() > MAX_TOKEN_DRIFT_SECS {
            return Err(ApiError::AuthFailed);
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| ApiError::AuthFailed)?;
        let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| ApiError::AuthFailed)?;
        let signature = Signature::from_bytes(&sig_arr);

        let message = format!("{AUTH_CONTEXT}\n{phone}\n{timestamp}");
        self.service_key
            .verify(message.as_bytes(), &signature)
            .map_err(|_| ApiError::AuthFailed)?;
        Ok(phone)
    }
}

/// Build a caller token the way the auth service does. Clients and tests use
/// this; the relay only ever verifies.
pub fn make_caller_token(service_key: &SigningKey, phone: &str, timestamp: i64) -> String {
    let message = format!("{AUTH_CONTEXT}\n{phone}\n{timestamp}");
    let signature = service_key.sign(message.as_bytes());
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(phone.as_bytes()),
        timestamp,
        URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    )
}

/// The authenticated principal attached to each request.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller {
    pub phone: String,
    /// Resolved from the phone→DID mapping; None until the caller has
    /// registered a device.
    pub did: Option<String>,
    /// Lookup key form of the phone; the rate-limit principal for callers
    /// who have not registered a DID yet.
    pub encrypted_phone: Option<String>,
}

/// Opaque request id, propagated from `X-Request-Id` or freshly generated.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Outermost middleware: attach a request id, and after the handler runs,
/// echo it as a response header and write the access log line.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    rlog_kv!(
        Info,
        json!({
            "request_id": request_id,
            "status": response.status().as_u16(),
            "method": method.as_str(),
            "path": path,
        }),
        "request completed"
    );
    response
}

/// Require a valid bearer token and attach the [`AuthenticatedCaller`].
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
    else {
        return ApiError::AuthFailed.into_response();
    };

    let verifier = {
        let st = state.lock().await;
        Arc::clone(&st.auth)
    };
    let phone = match verifier.verify(&token, crate::logging::now_ms() / 1000) {
        Ok(phone) => phone,
        Err(e) => return e.into_response(),
    };

    let (did, encrypted_phone) = {
        let st = state.lock().await;
        match st.cipher.encrypt_phone(&phone) {
            Ok(encrypted) => (
                st.storage.get_did(&encrypted).unwrap_or(None),
                Some(encrypted),
            ),
            Err(_) => (None, None),
        }
    };

    req.extensions_mut().insert(AuthenticatedCaller {
        phone,
        did,
        encrypted_phone,
    });
    next.run(req).await
}

/// Per-endpoint window configuration, keyed by the matched route pattern.
fn policy_for(path: &str) -> RateLimitPolicy {
    match path {
        "/api/account/salt" => RateLimitPolicy::per_minute(10),
        "/api/devices/register" => RateLimitPolicy {
            limit: 5,
            period_ms: 5 * 60_000,
        },
        "/api/devices/list" => RateLimitPolicy::per_minute(50),
        "/api/lookup/did" | "/api/lookup/batch" => RateLimitPolicy::per_minute(20),
        "/api/messages/send" => RateLimitPolicy::per_minute(100),
        "/api/messages/inbox" => RateLimitPolicy::per_minute(200),
        _ => DEFAULT_POLICY,
    }
}

/// Innermost middleware: count the request against its (endpoint, principal)
/// bucket and stamp the rate headers on whatever comes back.
pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let principal = req
        .extensions()
        .get::<AuthenticatedCaller>()
        .and_then(|caller| caller.did.clone().or_else(|| caller.encrypted_phone.clone()))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string());

    let decision = {
        let mut st = state.lock().await;
        let policy = policy_for(&endpoint);
        st.limiter
            .check(&endpoint, &principal, policy, crate::logging::now_ms())
    };

    let (mut response, limit, remaining, reset_at) = match decision {
        Decision::Allowed {
            limit,
            remaining,
            reset_at,
        } => (next.run(req).await, limit, remaining, reset_at),
        Decision::Rejected {
            limit,
            retry_after_secs,
            reset_at,
        } => (
            ApiError::RateLimited { retry_after_secs }.into_response(),
            limit,
            0,
            reset_at,
        ),
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&(reset_at / 1000).to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
    response
}
