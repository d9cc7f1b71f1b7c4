use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit},
    http::{header::RETRY_AFTER, request::Request, HeaderName, StatusCode},
    middleware::map_response,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    errors::AuthFailure,
    handlers::{
        email::{confirm_change_email, confirm_email, reset_password},
        sessions::{logout, refresh},
    },
    realtime::gateway_ws,
    types::{health, metrics},
};

#[derive(Clone)]
struct PeerIpKeyExtractor;

impl KeyExtractor for PeerIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|value| value.0.ip())
            .or_else(|| req.extensions().get::<SocketAddr>().map(SocketAddr::ip));
        Ok(peer_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
    }
}

async fn rate_limited_body(response: Response) -> Response {
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return response;
    }
    let retry_after = response.headers().get(RETRY_AFTER).cloned();
    let mut limited = AuthFailure::RateLimited.into_response();
    if let Some(value) = retry_after {
        limited.headers_mut().insert(RETRY_AFTER, value);
    }
    limited
}

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured limits are invalid or a backend cannot be
/// initialized.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    let app_state = AppState::new(config)?;
    build_router_with_state(config, app_state)
}

/// Build the router around an already constructed [`AppState`], so callers
/// can keep a handle to it.
///
/// # Errors
/// Returns an error if configured limits are invalid.
pub fn build_router_with_state(config: &AppConfig, app_state: AppState) -> anyhow::Result<Router> {
    config.validate()?;
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!("rate limit must be at least 1 request per minute"));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(PeerIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/email/confirm-email", get(confirm_email))
        .route("/email/reset-password", post(reset_password))
        .route("/email/change-email", get(confirm_change_email))
        .route("/sessions/refresh", post(refresh))
        .route("/sessions/logout", post(logout))
        .route("/gateway", get(gateway_ws));

    Ok(routes
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(map_response(rate_limited_body))
                .layer(governor_layer),
        ))
}
