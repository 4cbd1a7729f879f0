//! Credential records.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use time::OffsetDateTime;

/// Stored credential: user id plus bcrypt hash. Plaintext never reaches this type.
#[derive(Debug, Clone)]
pub struct UserRecord {
    /// Login identifier.
    pub user_id: String,
    /// bcrypt hash of the password.
    pub password_hash: String,
}

/// Errors raised by user stores.
#[derive(Debug, Error)]
pub enum UserStoreError {
    /// A user with this id already exists.
    #[error("user '{0}' already exists")]
    Duplicate(String),
    /// The underlying database failed.
    #[error("user store unavailable: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage for credential records.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user; fails with [`UserStoreError::Duplicate`] if the id is taken.
    async fn insert(&self, record: &UserRecord) -> Result<(), UserStoreError>;

    /// Look a user up by id.
    async fn find(&self, user_id: &str) -> Result<Option<UserRecord>, UserStoreError>;
}

/// Users in the `users` table.
#[derive(Clone)]
pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    /// Wrap a migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn insert(&self, record: &UserRecord) -> Result<(), UserStoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO users (user_id, password_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(&record.user_id)
        .bind(&record.password_hash)
        .bind(OffsetDateTime::now_utc().unix_timestamp())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(UserStoreError::Duplicate(record.user_id.clone()));
        }
        Ok(())
    }

    async fn find(&self, user_id: &str) -> Result<Option<UserRecord>, UserStoreError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT user_id, password_hash FROM users WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id, password_hash)| UserRecord {
            user_id,
            password_hash,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn duplicate_users_are_rejected() {
        let store = SqliteUserStore::new(db::connect_in_memory().await.expect("pool"));
        let record = UserRecord {
            user_id: "ada".into(),
            password_hash: "$2b$04$hash".into(),
        };
        store.insert(&record).await.expect("insert");
        assert!(matches!(
            store.insert(&record).await,
            Err(UserStoreError::Duplicate(id)) if id == "ada"
        ));
        let found = store.find("ada").await.expect("find").expect("present");
        assert_eq!(found.password_hash, "$2b$04$hash");
        assert!(store.find("bob").await.expect("find").is_none());
    }
}
