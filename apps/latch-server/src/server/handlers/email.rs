use axum::{
    extract::{Query, State},
    Json,
};
use latch_core::UserId;

use crate::server::{
    core::AppState,
    errors::AuthFailure,
    types::{ChallengeQuery, ChallengeResponse, ResetPasswordRequest},
};

fn challenge_user(query: &ChallengeQuery) -> Result<UserId, AuthFailure> {
    UserId::try_from(query.id).map_err(|_| AuthFailure::InvalidOrExpiredToken)
}

fn completed(status: &str) -> Json<ChallengeResponse> {
    Json(ChallengeResponse {
        status: status.to_owned(),
    })
}

pub(crate) async fn confirm_email(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> Result<Json<ChallengeResponse>, AuthFailure> {
    let user_id = challenge_user(&query)?;
    state.confirm_email(user_id, &query.token).await?;
    Ok(completed("email_confirmed"))
}

pub(crate) async fn reset_password(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<ChallengeResponse>, AuthFailure> {
    let user_id = challenge_user(&query)?;
    state
        .reset_password(user_id, &query.token, &payload.new_password)
        .await?;
    Ok(completed("password_reset"))
}

pub(crate) async fn confirm_change_email(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> Result<Json<ChallengeResponse>, AuthFailure> {
    let user_id = challenge_user(&query)?;
    state.confirm_change_email(user_id, &query.token).await?;
    Ok(completed("email_changed"))
}
