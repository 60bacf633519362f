// Postgres-backed cache shared by every relay process.
//
// Expiry is evaluated against the database clock so processes with skewed
// clocks agree on which entries are live.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{CacheError, KeyValueStore};

#[derive(Clone)]
pub struct PgKv {
    pool: PgPool,
}

impl PgKv {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for PgKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(
            r#"
SELECT value
FROM sync_cache
WHERE key = $1
  AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        sqlx::query(
            r#"
INSERT INTO sync_cache (key, value, expires_at)
VALUES ($1, $2, CASE WHEN $3::float8 IS NULL THEN NULL ELSE now() + make_interval(secs => $3::float8) END)
ON CONFLICT (key) DO UPDATE
SET value = EXCLUDED.value,
    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(|ttl| ttl.as_secs_f64()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM sync_cache WHERE key = $1").bind(key).execute(&self.pool).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let value = sqlx::query_scalar::<_, i64>(
            r#"
INSERT INTO sync_cache (key, value, expires_at)
VALUES ($1, convert_to($2::bigint::text, 'UTF8'), now() + make_interval(secs => $3::float8))
ON CONFLICT (key) DO UPDATE
SET value = convert_to((
        CASE
            WHEN sync_cache.expires_at IS NOT NULL AND sync_cache.expires_at <= now() THEN 0
            ELSE convert_from(sync_cache.value, 'UTF8')::bigint
        END + $2::bigint
    )::text, 'UTF8'),
    expires_at = EXCLUDED.expires_at
RETURNING convert_from(value, 'UTF8')::bigint
            "#,
        )
        .bind(key)
        .bind(delta)
        .bind(ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        Ok(value)
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let updated = sqlx::query(
            r#"
UPDATE sync_cache
SET expires_at = now() + make_interval(secs => $2::float8)
WHERE key = $1
  AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn set_if_changed(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, CacheError> {
        let written = sqlx::query(
            r#"
INSERT INTO sync_cache (key, value, expires_at)
VALUES ($1, $2, now() + make_interval(secs => $3::float8))
ON CONFLICT (key) DO UPDATE
SET value = EXCLUDED.value,
    expires_at = EXCLUDED.expires_at
WHERE sync_cache.value IS DISTINCT FROM EXCLUDED.value
   OR (sync_cache.expires_at IS NOT NULL AND sync_cache.expires_at <= now())
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(written == 1)
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let purged = sqlx::query(
            "DELETE FROM sync_cache WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(purged)
    }
}
