use axum::{extract::State, http::StatusCode, Json};

use crate::server::{
    core::AppState,
    errors::AuthFailure,
    token_service::SessionGrant,
    types::{SessionGrantResponse, SessionTokenRequest},
};

impl From<SessionGrant> for SessionGrantResponse {
    fn from(grant: SessionGrant) -> Self {
        Self {
            user_id: grant.session.user_id.get(),
            session_id: grant.session.session_id.to_string(),
            session_token: grant.session_token,
            expires_in_secs: grant.expires_in.as_secs(),
        }
    }
}

pub(crate) async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<SessionTokenRequest>,
) -> Result<Json<SessionGrantResponse>, AuthFailure> {
    let grant = state.refresh_session(&payload.session_token).await?;
    Ok(Json(grant.into()))
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    Json(payload): Json<SessionTokenRequest>,
) -> Result<StatusCode, AuthFailure> {
    state.logout_session(&payload.session_token).await?;
    Ok(StatusCode::NO_CONTENT)
}
