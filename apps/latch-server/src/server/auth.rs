use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHasher, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use latch_core::SessionId;
use sha2::{Digest, Sha256};

use super::{core::MAX_SUPPLIED_TOKEN_CHARS, errors::AuthFailure};

/// Secret length in bytes; 256 bits of OS entropy per token.
const SECRET_BYTES: usize = 32;
const SESSION_TOKEN_SEPARATOR: char = '.';

pub(crate) fn generate_secret() -> String {
    let mut secret = [0_u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut secret);
    URL_SAFE_NO_PAD.encode(secret)
}

pub(crate) fn hash_secret(value: &str) -> String {
    let digest: [u8; 32] = Sha256::digest(value.as_bytes()).into();
    URL_SAFE_NO_PAD.encode(digest)
}

/// Cheap shape check applied before any store lookup.
pub(crate) fn validate_supplied_token(value: &str) -> Result<(), AuthFailure> {
    if value.is_empty() || value.len() > MAX_SUPPLIED_TOKEN_CHARS {
        return Err(AuthFailure::InvalidOrExpiredToken);
    }
    Ok(())
}

pub(crate) fn validate_password(value: &str) -> Result<(), AuthFailure> {
    let len = value.len();
    if (12..=128).contains(&len) {
        Ok(())
    } else {
        Err(AuthFailure::InvalidRequest)
    }
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn format_session_token(session_id: SessionId, secret: &str) -> String {
    format!("{session_id}{SESSION_TOKEN_SEPARATOR}{secret}")
}

pub(crate) fn parse_session_token(token: &str) -> Result<(SessionId, &str), AuthFailure> {
    if token.is_empty() || token.len() > MAX_SUPPLIED_TOKEN_CHARS {
        return Err(AuthFailure::Unauthorized);
    }
    let (session_id, secret) = token
        .split_once(SESSION_TOKEN_SEPARATOR)
        .ok_or(AuthFailure::Unauthorized)?;
    if secret.is_empty() {
        return Err(AuthFailure::Unauthorized);
    }
    let session_id = SessionId::try_from(session_id).map_err(|_| AuthFailure::Unauthorized)?;
    Ok((session_id, secret))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}
