pub(crate) mod auth;
pub(crate) mod challenge;
pub(crate) mod core;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod metrics;
pub(crate) mod notifier;
pub(crate) mod realtime;
pub(crate) mod router;
pub(crate) mod token_service;
pub(crate) mod token_store;
pub(crate) mod types;
pub(crate) mod user_directory;

pub use self::core::{
    AppConfig, AppState, CloseReason, ConnectionControl, SmtpConfig, DEFAULT_SMTP_PORT,
};
pub use errors::{init_tracing, AuthFailure};
pub use realtime::ConnectionHandle;
pub use router::{build_router, build_router_with_state};
pub use token_service::SessionGrant;
