use async_trait::async_trait;
use chrono::Utc;

use super::{Db, KvEntry, KvStore};
use crate::Result;

/// `KvStore` over the `kv` table.
#[derive(Debug, Clone)]
pub struct SqliteKv {
    db: Db,
}

impl SqliteKv {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let entry = sqlx::query_as::<_, KvEntry>(
            r#"
            SELECT key, value, revision, updated_at
            FROM kv
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(entry)
    }

    async fn put(&self, key: &str, value: &str) -> Result<i64> {
        let revision = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO kv (key, value, revision, updated_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                revision = kv.revision + 1,
                updated_at = excluded.updated_at
            RETURNING revision
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await?;

        Ok(revision)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        value: &str,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kv (key, value, revision, updated_at)
                    VALUES (?1, ?2, 1, ?3)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(Utc::now())
                .execute(&self.db)
                .await?
            }
            Some(revision) => {
                sqlx::query(
                    r#"
                    UPDATE kv
                    SET value = ?2, revision = revision + 1, updated_at = ?3
                    WHERE key = ?1 AND revision = ?4
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(Utc::now())
                .bind(revision)
                .execute(&self.db)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let entries = sqlx::query_as::<_, KvEntry>(
            r#"
            SELECT key, value, revision, updated_at
            FROM kv
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }
}
