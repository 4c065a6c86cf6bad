/// API key persistence
///
/// Keys are scoped by user id; the single-user deployment always uses
/// [`DEFAULT_USER`]. All queries are parameterized.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

/// User id every key belongs to in a single-user deployment
pub const DEFAULT_USER: &str = "default";

/// Stored API key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub name: String,
    pub value: String,
}

/// API key repository
pub struct ApiKeyRepository {
    pool: SqlitePool,
}

impl ApiKeyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All keys of `user_id`, ordered by name
    pub async fn list(&self, user_id: &str) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT name, value FROM api_keys WHERE user_id = ? ORDER BY name")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list API keys")?;

        Ok(rows
            .into_iter()
            .map(|r| ApiKey {
                name: r.get("name"),
                value: r.get("value"),
            })
            .collect())
    }

    /// Value of one key
    pub async fn get(&self, user_id: &str, name: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM api_keys WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch API key")?;

        Ok(value)
    }

    /// Insert or overwrite one key
    pub async fn upsert(&self, user_id: &str, name: &str, value: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "INSERT INTO api_keys (user_id, name, value, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_id, name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(name)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to store API key")?;

        Ok(())
    }

    /// Delete one key; returns whether it existed
    pub async fn delete(&self, user_id: &str, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM api_keys WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("Failed to delete API key")?;

        Ok(result.rows_affected() > 0)
    }

    /// Replace the whole key set of `user_id` in one transaction
    pub async fn replace_all(&self, user_id: &str, keys: &[ApiKey]) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query("DELETE FROM api_keys WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to clear API keys")?;

        for key in keys {
            sqlx::query(
                "INSERT INTO api_keys (user_id, name, value, updated_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(user_id, name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(user_id)
            .bind(&key.name)
            .bind(&key.value)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to store API key '{}'", key.name))?;
        }

        tx.commit().await.context("Failed to commit API keys")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("ragtime.db"))
            .await
            .unwrap();
        (temp_dir, db)
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let (_dir, db) = setup().await;
        let repo = db.api_keys();

        repo.upsert(DEFAULT_USER, "OPENAI_API_KEY", "first").await.unwrap();
        repo.upsert(DEFAULT_USER, "OPENAI_API_KEY", "second").await.unwrap();

        assert_eq!(
            repo.get(DEFAULT_USER, "OPENAI_API_KEY").await.unwrap(),
            Some("second".to_string())
        );
        assert_eq!(repo.list(DEFAULT_USER).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_all_drops_missing_keys() {
        let (_dir, db) = setup().await;
        let repo = db.api_keys();

        repo.upsert(DEFAULT_USER, "OLD_KEY", "x").await.unwrap();
        repo.replace_all(
            DEFAULT_USER,
            &[ApiKey {
                name: "MISTRAL_API_KEY".into(),
                value: "m".into(),
            }],
        )
        .await
        .unwrap();

        let keys = repo.list(DEFAULT_USER).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "MISTRAL_API_KEY");
    }

    #[tokio::test]
    async fn test_keys_are_scoped_by_user() {
        let (_dir, db) = setup().await;
        let repo = db.api_keys();

        repo.upsert("alice", "OPENAI_API_KEY", "a").await.unwrap();
        assert!(repo.get(DEFAULT_USER, "OPENAI_API_KEY").await.unwrap().is_none());
        assert!(repo.delete("alice", "OPENAI_API_KEY").await.unwrap());
        assert!(!repo.delete("alice", "OPENAI_API_KEY").await.unwrap());
    }
}
