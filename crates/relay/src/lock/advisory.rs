// Postgres session-level advisory locks.
//
// A session lock belongs to the connection that took it, so each held lock
// pins one pooled connection until release. If the holder goes away without
// releasing, the connection is closed instead of being returned to the pool
// and the server frees the lock.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::warn;

use super::{Held, LockBackend, LockError, LockHandle};

pub(super) struct AdvisoryHold {
    conn: Option<PoolConnection<Postgres>>,
}

impl Drop for AdvisoryHold {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
    }
}

#[derive(Clone)]
pub struct AdvisoryLocks {
    pool: PgPool,
}

impl AdvisoryLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockBackend for AdvisoryLocks {
    async fn try_acquire(&self, lock_id: i64) -> Result<Option<LockHandle>, LockError> {
        let mut conn = self.pool.acquire().await.map_err(|error| match error {
            // Every connection is checked out, many of them by lock holders.
            sqlx::Error::PoolTimedOut if self.pool.size() > 0 => LockError::Busy,
            other => LockError::Unavailable(other.to_string()),
        })?;

        let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|error| LockError::Unavailable(error.to_string()))?;

        if !locked {
            return Ok(None);
        }

        Ok(Some(LockHandle { lock_id, held: Held::Advisory(AdvisoryHold { conn: Some(conn) }) }))
    }

    async fn release(&self, handle: LockHandle) {
        let LockHandle { lock_id, held } = handle;
        let Held::Advisory(mut hold) = held else {
            return;
        };
        let Some(mut conn) = hold.conn.take() else {
            return;
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(true) => {}
            Ok(false) => {
                warn!(lock_id, "advisory lock was not held at release; discarding connection");
                conn.close_on_drop();
            }
            Err(error) => {
                warn!(lock_id, error = %error, "advisory unlock failed; discarding connection");
                conn.close_on_drop();
            }
        }
    }
}
