#![forbid(unsafe_code)]

mod server;

pub use latch_core::{ActionKind, EmailAddress, Session, SessionId, UserId};
pub use server::{
    build_router, build_router_with_state, init_tracing, AppConfig, AppState, AuthFailure,
    CloseReason, ConnectionControl, ConnectionHandle, SessionGrant, SmtpConfig, DEFAULT_SMTP_PORT,
};
