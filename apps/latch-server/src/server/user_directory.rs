use std::collections::HashMap;

use latch_core::{EmailAddress, UserId};
use sqlx::PgPool;
use tokio::sync::RwLock;

use super::{auth::hash_password, core::AppState, errors::AuthFailure};

pub(crate) trait UserMutation {
    /// Create the user record, or replace its email if it already exists.
    async fn provision_user(
        &self,
        user_id: UserId,
        email: Option<&EmailAddress>,
    ) -> Result<(), AuthFailure>;

    async fn store_password_hash(&self, user_id: UserId, password_hash: &str)
        -> Result<(), AuthFailure>;

    async fn set_email_address(
        &self,
        user_id: UserId,
        address: &EmailAddress,
    ) -> Result<(), AuthFailure>;
}

pub(crate) struct PostgresUserDirectory {
    pool: PgPool,
}

impl PostgresUserDirectory {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_write_error(event: &'static str, error: &sqlx::Error) -> AuthFailure {
    if error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
    {
        return AuthFailure::InvalidRequest;
    }
    tracing::error!(event, error = %error);
    AuthFailure::Internal
}

impl UserMutation for PostgresUserDirectory {
    async fn provision_user(
        &self,
        user_id: UserId,
        email: Option<&EmailAddress>,
    ) -> Result<(), AuthFailure> {
        sqlx::query(
            "INSERT INTO users (user_id, email) VALUES ($1, $2)
             ON CONFLICT (user_id) DO UPDATE SET email = EXCLUDED.email",
        )
        .bind(user_id.get())
        .bind(email.map(EmailAddress::as_str))
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error("users.provision", &e))?;
        Ok(())
    }

    async fn store_password_hash(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<(), AuthFailure> {
        let result = sqlx::query("UPDATE users SET password_hash = $1 WHERE user_id = $2")
            .bind(password_hash)
            .bind(user_id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(event = "users.set_password", error = %e);
                AuthFailure::Internal
            })?;
        if result.rows_affected() == 0 {
            return Err(AuthFailure::UserNotFound);
        }
        Ok(())
    }

    async fn set_email_address(
        &self,
        user_id: UserId,
        address: &EmailAddress,
    ) -> Result<(), AuthFailure> {
        let result = sqlx::query("UPDATE users SET email = $1 WHERE user_id = $2")
            .bind(address.as_str())
            .bind(user_id.get())
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error("users.set_email", &e))?;
        if result.rows_affected() == 0 {
            return Err(AuthFailure::UserNotFound);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct UserRecord {
    pub(crate) email: Option<EmailAddress>,
    pub(crate) password_hash: Option<String>,
}

pub(crate) struct InMemoryUserDirectory {
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl InMemoryUserDirectory {
    pub(crate) fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) async fn user(&self, user_id: UserId) -> Option<UserRecord> {
        self.users.read().await.get(&user_id).cloned()
    }
}

fn email_taken(users: &HashMap<UserId, UserRecord>, user_id: UserId, address: &EmailAddress) -> bool {
    users
        .iter()
        .any(|(id, record)| *id != user_id && record.email.as_ref() == Some(address))
}

impl UserMutation for InMemoryUserDirectory {
    async fn provision_user(
        &self,
        user_id: UserId,
        email: Option<&EmailAddress>,
    ) -> Result<(), AuthFailure> {
        let mut users = self.users.write().await;
        if email.is_some_and(|address| email_taken(&users, user_id, address)) {
            return Err(AuthFailure::InvalidRequest);
        }
        users.entry(user_id).or_default().email = email.cloned();
        Ok(())
    }

    async fn store_password_hash(
        &self,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<(), AuthFailure> {
        let mut users = self.users.write().await;
        let record = users.get_mut(&user_id).ok_or(AuthFailure::UserNotFound)?;
        record.password_hash = Some(password_hash.to_owned());
        Ok(())
    }

    async fn set_email_address(
        &self,
        user_id: UserId,
        address: &EmailAddress,
    ) -> Result<(), AuthFailure> {
        let mut users = self.users.write().await;
        if email_taken(&users, user_id, address) {
            return Err(AuthFailure::InvalidRequest);
        }
        let record = users.get_mut(&user_id).ok_or(AuthFailure::UserNotFound)?;
        record.email = Some(address.clone());
        Ok(())
    }
}

pub(crate) enum UserDirectory {
    Postgres(PostgresUserDirectory),
    InMemory(InMemoryUserDirectory),
}

impl UserDirectory {
    pub(crate) async fn provision_user(
        &self,
        user_id: UserId,
        email: Option<&EmailAddress>,
    ) -> Result<(), AuthFailure> {
        match self {
            Self::Postgres(users) => users.provision_user(user_id, email).await,
            Self::InMemory(users) => users.provision_user(user_id, email).await,
        }
    }

    /// Hash `new_password` and store it for `user_id`.
    pub(crate) async fn set_password(
        &self,
        user_id: UserId,
        new_password: &str,
    ) -> Result<(), AuthFailure> {
        let password_hash = hash_password(new_password).map_err(|e| {
            tracing::error!(event = "users.set_password", error = %e);
            AuthFailure::Internal
        })?;
        match self {
            Self::Postgres(users) => users.store_password_hash(user_id, &password_hash).await,
            Self::InMemory(users) => users.store_password_hash(user_id, &password_hash).await,
        }
    }

    pub(crate) async fn set_email_address(
        &self,
        user_id: UserId,
        address: &EmailAddress,
    ) -> Result<(), AuthFailure> {
        match self {
            Self::Postgres(users) => users.set_email_address(user_id, address).await,
            Self::InMemory(users) => users.set_email_address(user_id, address).await,
        }
    }

    #[cfg(test)]
    pub(crate) fn in_memory(&self) -> Option<&InMemoryUserDirectory> {
        match self {
            Self::Postgres(_) => None,
            Self::InMemory(users) => Some(users),
        }
    }
}

impl AppState {
    /// Create or update the account record that challenge flows mutate.
    ///
    /// # Errors
    /// Returns [`AuthFailure::InvalidRequest`] when another user already owns
    /// `email`, or a backend failure.
    pub async fn provision_user(
        &self,
        user_id: UserId,
        email: Option<EmailAddress>,
    ) -> Result<(), AuthFailure> {
        self.users.provision_user(user_id, email.as_ref()).await?;
        tracing::info!(event = "users.provision", user_id = user_id.get());
        Ok(())
    }
}
