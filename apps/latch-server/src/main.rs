#![forbid(unsafe_code)]

use std::{net::SocketAddr, str::FromStr, time::Duration};

use latch_server::{build_router, init_tracing, AppConfig, SmtpConfig, DEFAULT_SMTP_PORT};
use tokio::net::TcpListener;

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name).map_or_else(
        |_| Ok(default),
        |value| {
            value
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {name} value {value:?}: {e}"))
        },
    )
}

fn smtp_from_env() -> anyhow::Result<Option<SmtpConfig>> {
    let Ok(host) = std::env::var("LATCH_SMTP_HOST") else {
        return Ok(None);
    };
    Ok(Some(SmtpConfig {
        host,
        port: env_or("LATCH_SMTP_PORT", DEFAULT_SMTP_PORT)?,
        username: std::env::var("LATCH_SMTP_USER").ok(),
        password: std::env::var("LATCH_SMTP_PASSWORD").ok(),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let defaults = AppConfig::default();
    let app_config = AppConfig {
        max_body_bytes: env_or("LATCH_MAX_BODY_BYTES", defaults.max_body_bytes)?,
        request_timeout: Duration::from_secs(env_or(
            "LATCH_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?),
        rate_limit_requests_per_minute: env_or(
            "LATCH_RATE_LIMIT_REQUESTS_PER_MINUTE",
            defaults.rate_limit_requests_per_minute,
        )?,
        link_base_url: std::env::var("LATCH_LINK_BASE_URL")
            .unwrap_or_else(|_| defaults.link_base_url.clone()),
        email_from: std::env::var("LATCH_SMTP_FROM")
            .unwrap_or_else(|_| defaults.email_from.clone()),
        challenge_ttl_hours: env_or("LATCH_CHALLENGE_TTL_HOURS", defaults.challenge_ttl_hours)?,
        max_sessions_per_user: env_or(
            "LATCH_MAX_SESSIONS_PER_USER",
            defaults.max_sessions_per_user,
        )?,
        session_ttl: Duration::from_secs(env_or(
            "LATCH_SESSION_TTL_SECS",
            defaults.session_ttl.as_secs(),
        )?),
        store_timeout: Duration::from_millis(env_or(
            "LATCH_STORE_TIMEOUT_MILLIS",
            u64::try_from(defaults.store_timeout.as_millis()).unwrap_or(u64::MAX),
        )?),
        gateway_outbound_queue: env_or(
            "LATCH_GATEWAY_OUTBOUND_QUEUE",
            defaults.gateway_outbound_queue,
        )?,
        max_gateway_event_bytes: env_or(
            "LATCH_MAX_GATEWAY_EVENT_BYTES",
            defaults.max_gateway_event_bytes,
        )?,
        redis_url: std::env::var("LATCH_REDIS_URL").ok(),
        database_url: std::env::var("LATCH_DATABASE_URL").ok(),
        smtp: smtp_from_env()?,
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("LATCH_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid LATCH_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "latch-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
