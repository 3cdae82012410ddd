//! Axum router construction.
//!
//! `/health` is open; everything under `/api` sits behind the bearer-auth
//! and rate-limit middleware. The request-id middleware wraps the whole
//! tree so even auth failures carry an `X-Request-Id`.

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::web::auth;
use crate::web::handlers;
use crate::web::state::SharedState;

/// Build the complete router with all API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let api = Router::new()
        // Identity
        .route("/api/account/salt", post(handlers::account::salt_handler))
        .route("/api/devices/register", post(handlers::devices::register_handler))
        .route("/api/devices/list", post(handlers::devices::list_handler))
        .route("/api/devices/heartbeat", post(handlers::devices::heartbeat_handler))
        .route("/api/lookup/did", post(handlers::lookup::lookup_handler))
        .route("/api/lookup/batch", post(handlers::lookup::batch_lookup_handler))
        // Messages
        .route("/api/messages/send", post(handlers::messages::send_handler))
        .route("/api/messages/inbox", get(handlers::messages::inbox_handler))
        .route(
            "/api/messages/mark-delivered",
            post(handlers::messages::mark_delivered_handler),
        )
        .route(
            "/api/messages/:message_id",
            delete(handlers::messages::delete_handler),
        )
        // Jars
        .route("/api/jars/list", get(handlers::jars::list_jars_handler))
        .route(
            "/api/jars/:jar_id/receipts",
            post(handlers::jars::store_receipt_handler)
                .get(handlers::jars::get_receipts_handler),
        )
        // Auth runs before the limiter so buckets key on the caller's DID.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_handler))
        .merge(api)
        .layer(middleware::from_fn(auth::request_id_middleware))
        .with_state(state)
}
