use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use anyhow::anyhow;
use sqlx::postgres::PgPoolOptions;

use super::{
    notifier::{Mailer, OutboxMailer, SmtpMailer},
    realtime::connection_registry::ConnectionRegistry,
    token_service::TokenService,
    token_store::{InMemoryTokenStore, RedisTokenStore, TokenStore},
    user_directory::{InMemoryUserDirectory, PostgresUserDirectory, UserDirectory},
};

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 64 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const DEFAULT_CHALLENGE_TTL_HOURS: u64 = 24;
pub const DEFAULT_MAX_SESSIONS_PER_USER: usize = 5;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_STORE_TIMEOUT_MILLIS: u64 = 2_000;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = latch_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_EMAIL_FROM: &str = "noreply@latch.local";
pub const DEFAULT_LINK_BASE_URL: &str = "http://localhost:3000";
pub(crate) const MAX_CHALLENGE_TTL_HOURS: u64 = 7 * 24;
pub(crate) const MAX_SUPPLIED_TOKEN_CHARS: usize = 256;
pub(crate) const OUTBOX_RETAINED_MESSAGES: usize = 128;
pub(crate) const GATEWAY_PING_INTERVAL_SECS: u64 = 30;

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

type Counter<K> = Mutex<HashMap<K, u64>>;

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Counter<&'static str>,
    pub(crate) challenges_issued: Counter<&'static str>,
    pub(crate) challenge_verifications: Counter<(&'static str, &'static str)>,
    pub(crate) sessions_evicted: Counter<&'static str>,
    pub(crate) ws_disconnects: Counter<&'static str>,
    pub(crate) gateway_events_emitted: Counter<(String, String)>,
    pub(crate) gateway_events_dropped: Counter<(String, String, String)>,
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub link_base_url: String,
    pub email_from: String,
    pub challenge_ttl_hours: u64,
    pub max_sessions_per_user: usize,
    pub session_ttl: Duration,
    pub store_timeout: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub smtp: Option<SmtpConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            link_base_url: String::from(DEFAULT_LINK_BASE_URL),
            email_from: String::from(DEFAULT_EMAIL_FROM),
            challenge_ttl_hours: DEFAULT_CHALLENGE_TTL_HOURS,
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MILLIS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            redis_url: None,
            database_url: None,
            smtp: None,
        }
    }
}

impl AppConfig {
    /// Reject limits the runtime cannot honor.
    ///
    /// # Errors
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_sessions_per_user == 0 {
            return Err(anyhow!("max sessions per user must be at least 1"));
        }
        if self.challenge_ttl_hours == 0 || self.challenge_ttl_hours > MAX_CHALLENGE_TTL_HOURS {
            return Err(anyhow!(
                "challenge ttl must be between 1 and {MAX_CHALLENGE_TTL_HOURS} hours"
            ));
        }
        if self.session_ttl < Duration::from_secs(60) {
            return Err(anyhow!("session ttl must be at least 60 seconds"));
        }
        if self.store_timeout.is_zero() {
            return Err(anyhow!("store timeout must be non-zero"));
        }
        if self.gateway_outbound_queue == 0 {
            return Err(anyhow!("gateway outbound queue must hold at least 1 event"));
        }
        if self.max_gateway_event_bytes > latch_protocol::MAX_EVENT_BYTES {
            return Err(anyhow!(
                "gateway event limit cannot exceed protocol max of {} bytes",
                latch_protocol::MAX_EVENT_BYTES
            ));
        }
        if !(self.link_base_url.starts_with("http://") || self.link_base_url.starts_with("https://"))
        {
            return Err(anyhow!("link base url must be an http(s) url"));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) link_base_url: String,
    pub(crate) challenge_ttl_hours: u64,
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) max_gateway_event_bytes: usize,
}

/// Shared handle to every collaborator the core composes.
#[derive(Clone)]
pub struct AppState {
    pub(crate) tokens: TokenService,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) mailer: Arc<Mailer>,
    pub(crate) users: Arc<UserDirectory>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    /// Build the state from configuration. Remote backends connect lazily.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a backend URL cannot be parsed.
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let store = if let Some(redis_url) = &config.redis_url {
            TokenStore::Redis(
                RedisTokenStore::new(redis_url, config.store_timeout)
                    .map_err(|e| anyhow!("redis client init failed: {e}"))?,
            )
        } else {
            tracing::warn!(
                event = "store.init",
                backend = "in_memory",
                "no redis url configured; tokens and sessions will not survive restarts"
            );
            TokenStore::InMemory(InMemoryTokenStore::new())
        };
        tracing::info!(event = "store.init", backend = store.backend());

        let users = if let Some(database_url) = &config.database_url {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(config.store_timeout)
                .connect_lazy(database_url)
                .map_err(|e| anyhow!("postgres pool init failed: {e}"))?;
            UserDirectory::Postgres(PostgresUserDirectory::new(pool))
        } else {
            UserDirectory::InMemory(InMemoryUserDirectory::new())
        };

        let mailer = if let Some(smtp) = &config.smtp {
            Mailer::Smtp(
                SmtpMailer::new(smtp, &config.email_from)
                    .map_err(|e| anyhow!("smtp transport init failed: {e}"))?,
            )
        } else {
            Mailer::Outbox(OutboxMailer::new(OUTBOX_RETAINED_MESSAGES))
        };

        Ok(Self::from_parts(config, store, users, mailer))
    }

    pub(crate) fn from_parts(
        config: &AppConfig,
        store: TokenStore,
        users: UserDirectory,
        mailer: Mailer,
    ) -> Self {
        Self {
            tokens: TokenService::new(
                store,
                Duration::from_secs(config.challenge_ttl_hours * 60 * 60),
                config.session_ttl,
            ),
            registry: ConnectionRegistry::new(config.max_sessions_per_user),
            mailer: Arc::new(mailer),
            users: Arc::new(users),
            runtime: Arc::new(RuntimeConfig {
                link_base_url: config.link_base_url.trim_end_matches('/').to_owned(),
                challenge_ttl_hours: config.challenge_ttl_hours,
                gateway_outbound_queue: config.gateway_outbound_queue,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
            }),
        }
    }
}

/// Out-of-band instruction delivered to a connection's writer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionControl {
    Open,
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SlowConsumer,
    SessionEvicted,
    SessionReplaced,
    SessionRevoked,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SlowConsumer => "slow_consumer",
            Self::SessionEvicted => "session_evicted",
            Self::SessionReplaced => "session_replaced",
            Self::SessionRevoked => "session_revoked",
        }
    }
}
