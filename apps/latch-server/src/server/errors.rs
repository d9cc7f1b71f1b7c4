use axum::{http::StatusCode, response::IntoResponse, Json};

use super::{metrics::record_auth_failure, token_store::StoreError, types::ErrorBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidRequest,
    /// Supplied challenge token is absent, expired, or wrong. The cases are
    /// deliberately indistinguishable.
    InvalidOrExpiredToken,
    Unauthorized,
    EmailNotConfirmed,
    UserNotFound,
    RateLimited,
    /// Retryable; the issued token stays valid.
    NotificationDeliveryFailed,
    StoreUnavailable,
    Internal,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for AuthFailure {}

impl From<StoreError> for AuthFailure {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Unavailable(_) | StoreError::Timeout => Self::StoreUnavailable,
            StoreError::Corrupt(_) => Self::Internal,
        }
    }
}

impl AuthFailure {
    fn status_and_code(self) -> (StatusCode, &'static str) {
        match self {
            Self::InvalidRequest => (StatusCode::BAD_REQUEST, "invalid_request"),
            Self::InvalidOrExpiredToken => (StatusCode::UNAUTHORIZED, "invalid_or_expired_token"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
            Self::EmailNotConfirmed => (StatusCode::FORBIDDEN, "email_not_confirmed"),
            Self::UserNotFound => (StatusCode::NOT_FOUND, "not_found"),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Self::NotificationDeliveryFailed => {
                (StatusCode::SERVICE_UNAVAILABLE, "notification_delivery_failed")
            }
            Self::StoreUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
            Self::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidOrExpiredToken => record_auth_failure("invalid_or_expired_token"),
            Self::Unauthorized => record_auth_failure("unauthorized"),
            Self::EmailNotConfirmed => record_auth_failure("email_not_confirmed"),
            Self::InvalidRequest
            | Self::UserNotFound
            | Self::RateLimited
            | Self::NotificationDeliveryFailed
            | Self::StoreUnavailable
            | Self::Internal => {}
        }

        let (status, error) = self.status_and_code();
        (status, Json(ErrorBody { error })).into_response()
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, response::IntoResponse};

    use super::AuthFailure;
    use crate::server::token_store::StoreError;

    #[test]
    fn store_outages_map_to_service_unavailable() {
        assert_eq!(
            AuthFailure::from(StoreError::Timeout),
            AuthFailure::StoreUnavailable
        );
        assert_eq!(
            AuthFailure::from(StoreError::Unavailable(String::from("refused"))),
            AuthFailure::StoreUnavailable
        );
        assert_eq!(
            AuthFailure::from(StoreError::Corrupt(String::from("bad json"))),
            AuthFailure::Internal
        );
    }

    #[test]
    fn delivery_failure_is_reported_as_retryable() {
        let response = AuthFailure::NotificationDeliveryFailed.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn token_failure_body_is_generic() {
        let response = AuthFailure::InvalidOrExpiredToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"error":"invalid_or_expired_token"}"#);
    }
}
