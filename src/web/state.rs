//! Shared application state.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::blobstore::BlobStore;
use crate::crypto::PhoneCipher;
use crate::push::PushService;
use crate::ratelimit::RateLimiter;
use crate::storage::Storage;
use crate::web::auth::AuthVerifier;

pub struct AppState {
    pub storage: Storage,
    pub blobs: Arc<dyn BlobStore>,
    pub cipher: PhoneCipher,
    pub auth: Arc<dyn AuthVerifier>,
    pub push: Option<Arc<PushService>>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(
        storage: Storage,
        blobs: Arc<dyn BlobStore>,
        cipher: PhoneCipher,
        auth: Arc<dyn AuthVerifier>,
        push: Option<Arc<PushService>>,
    ) -> Self {
        Self {
            storage,
            blobs,
            cipher,
            auth,
            push,
            limiter: RateLimiter::new(),
        }
    }
}

pub type SharedState = Arc<Mutex<AppState>>;
