//! Session endpoints.

use crate::auth::AuthUser;
use crate::state::AppState;
use axum::{extract::State, http::StatusCode};

/// `POST /logout`: revoke the bearer token used for this request.
#[allow(clippy::unused_async)]
pub async fn logout(State(state): State<AppState>, user: AuthUser) -> StatusCode {
    state.revocations.revoke(&user.token, user.expires_at);
    tracing::info!(user_id = %user.user_id, "Token revoked");
    StatusCode::NO_CONTENT
}
