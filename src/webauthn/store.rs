//! Credential-record persistence.
//!
//! The store is the firewall's single source of truth for "is this account
//! protected": an account is enabled exactly when a credential record exists
//! for it. Two implementations are provided, an in-memory map for tests and
//! single-node runs, and a Postgres-backed store for production.

use crate::webauthn::{CredentialRecord, UserQuery, WebauthnUser};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether a credential record exists for the account.
    async fn is_enabled(&self, query: &UserQuery) -> Result<bool>;

    /// Load the account with its credential, `None` when no record exists.
    async fn get_user(&self, query: &UserQuery) -> Result<Option<WebauthnUser>>;

    /// Persist the credential produced by a finished registration.
    async fn create(&self, user: &WebauthnUser, record: &CredentialRecord) -> Result<()>;

    /// Remove the account's credential record. Deleting an absent record is
    /// not an error.
    async fn delete(&self, username: &str) -> Result<()>;
}

#[derive(Clone)]
struct StoredCredential {
    user_id: i64,
    username: String,
    record: CredentialRecord,
}

/// In-memory credential store, keyed by user id.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<i64, StoredCredential>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn find(&self, query: &UserQuery) -> Option<StoredCredential> {
        let records = self.records.read().await;
        match query {
            UserQuery::ById(id) => records.get(id).cloned(),
            UserQuery::ByName(name) => records
                .values()
                .find(|stored| stored.username == *name)
                .cloned(),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn is_enabled(&self, query: &UserQuery) -> Result<bool> {
        Ok(self.find(query).await.is_some())
    }

    async fn get_user(&self, query: &UserQuery) -> Result<Option<WebauthnUser>> {
        Ok(self.find(query).await.map(|stored| WebauthnUser {
            id: stored.user_id,
            name: stored.username,
            credential: Some(stored.record),
        }))
    }

    async fn create(&self, user: &WebauthnUser, record: &CredentialRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(
            user.id,
            StoredCredential {
                user_id: user.id,
                username: user.name.clone(),
                record: record.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<()> {
        let mut records = self.records.write().await;
        records.retain(|_, stored| stored.username != username);
        Ok(())
    }
}

/// Postgres-backed credential store.
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the credentials table when it does not exist yet.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS webauthn_credentials (
                user_id BIGINT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                credential_id TEXT NOT NULL,
                credential BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create webauthn_credentials table")?;
        Ok(())
    }

    fn row_to_user(row: &PgRow) -> WebauthnUser {
        WebauthnUser {
            id: row.get("user_id"),
            name: row.get("username"),
            credential: Some(CredentialRecord {
                credential_id: row.get("credential_id"),
                blob: row.get("credential"),
            }),
        }
    }

    fn where_clause(query: &UserQuery) -> &'static str {
        match query {
            UserQuery::ById(_) => "user_id = $1",
            UserQuery::ByName(_) => "username = $1",
        }
    }

    fn bind_query<'q>(
        statement: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        query: &'q UserQuery,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        match query {
            UserQuery::ById(id) => statement.bind(*id),
            UserQuery::ByName(name) => statement.bind(name.as_str()),
        }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn is_enabled(&self, query: &UserQuery) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM webauthn_credentials WHERE {}",
            Self::where_clause(query)
        );
        let row = Self::bind_query(sqlx::query(&sql), query)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check credential record")?;
        Ok(row.is_some())
    }

    async fn get_user(&self, query: &UserQuery) -> Result<Option<WebauthnUser>> {
        let sql = format!(
            "SELECT user_id, username, credential_id, credential FROM webauthn_credentials WHERE {}",
            Self::where_clause(query)
        );
        let row = Self::bind_query(sqlx::query(&sql), query)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch credential record")?;
        Ok(row.as_ref().map(Self::row_to_user))
    }

    async fn create(&self, user: &WebauthnUser, record: &CredentialRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webauthn_credentials (user_id, username, credential_id, credential)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET username = $2, credential_id = $3, credential = $4
            ",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&record.credential_id)
        .bind(&record.blob)
        .execute(&self.pool)
        .await
        .context("Failed to insert credential record")?;
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<()> {
        sqlx::query("DELETE FROM webauthn_credentials WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await
            .context("Failed to delete credential record")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> CredentialRecord {
        CredentialRecord {
            credential_id: id.to_string(),
            blob: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemoryCredentialStore::new();
        let alice = WebauthnUser::new(7, "alice");

        assert!(!store
            .is_enabled(&UserQuery::ByName("alice".to_string()))
            .await
            .expect("is_enabled"));

        store.create(&alice, &record("cred-7")).await.expect("create");

        assert!(store.is_enabled(&UserQuery::ById(7)).await.expect("is_enabled"));
        let loaded = store
            .get_user(&UserQuery::ByName("alice".to_string()))
            .await
            .expect("get_user")
            .expect("present");
        assert_eq!(loaded.id, 7);
        assert_eq!(
            loaded.credential.map(|c| c.credential_id),
            Some("cred-7".to_string())
        );

        store.delete("alice").await.expect("delete");
        assert!(!store.is_enabled(&UserQuery::ById(7)).await.expect("is_enabled"));
    }

    #[tokio::test]
    async fn test_memory_store_delete_absent_is_noop() {
        let store = MemoryCredentialStore::new();
        store.delete("nobody").await.expect("delete");
    }

    #[tokio::test]
    async fn test_memory_store_reenroll_replaces_credential() {
        let store = MemoryCredentialStore::new();
        let alice = WebauthnUser::new(7, "alice");

        store.create(&alice, &record("first")).await.expect("create");
        store.create(&alice, &record("second")).await.expect("create");

        let loaded = store
            .get_user(&UserQuery::ById(7))
            .await
            .expect("get_user")
            .expect("present");
        assert_eq!(
            loaded.credential.map(|c| c.credential_id),
            Some("second".to_string())
        );
    }
}
