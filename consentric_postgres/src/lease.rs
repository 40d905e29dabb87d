//! Cluster-wide lease on a single row: owner plus expiry, updated
//! conditionally, so exactly one replica sweeps at a time.

use async_trait::async_trait;
use sqlx::{query, Pool, Postgres};

use consentric::sweeper::{LeaseError, LeaseStore};

#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: Pool<Postgres>,
}

impl PostgresLeaseStore {
    #[must_use]
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: chrono::Duration,
    ) -> Result<bool, LeaseError> {
        let ttl_seconds = ttl.num_seconds().max(1) as f64;

        let result = query(
            "INSERT INTO leases (name, owner, expires_at) \
             VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
             ON CONFLICT (name) DO UPDATE SET \
                 owner = EXCLUDED.owner, \
                 expires_at = EXCLUDED.expires_at \
             WHERE leases.owner = EXCLUDED.owner OR leases.expires_at <= NOW()",
        )
        .bind(name)
        .bind(owner)
        .bind(ttl_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| LeaseError::Unavailable(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<(), LeaseError> {
        query("DELETE FROM leases WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| LeaseError::Unavailable(e.to_string()))?;

        Ok(())
    }
}
