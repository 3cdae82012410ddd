//! Account salt issuance.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{extract::State, Extension, Json};

use crate::error::ApiError;
use crate::identity;
use crate::web::auth::AuthenticatedCaller;
use crate::web::state::SharedState;

/// POST /api/account/salt — get-or-create the caller's account salt.
///
/// 201 with `created: true` on first issuance, 200 with the stored salt
/// afterwards. The phone comes from the verified caller token, never the
/// body, so a caller can only ever obtain their own salt.
pub async fn salt_handler(
    State(state): State<SharedState>,
    Extension(caller): Extension<AuthenticatedCaller>,
) -> Result<Response, ApiError> {
    let st = state.lock().await;
    let result = identity::get_or_create_salt(&st.storage, &st.cipher, &caller.phone)?;

    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(serde_json::json!({
            "salt": result.salt,
            "created": result.created,
        })),
    )
        .into_response())
}
