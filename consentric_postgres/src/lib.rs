//! PostgreSQL backends for consentric: the append-only event store with its
//! snapshot table, the query read models, and the cluster-wide lease used by
//! the cleanup sweeper.

mod lease;
mod read_models;
mod store;

pub use lease::PostgresLeaseStore;
pub use read_models::PostgresReadModels;
pub use store::PostgresEventStore;

use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    Pool, Postgres,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("db error: {0}")]
    Db(sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid version number")]
    InvalidVersionNumber,
    #[error("optimistic concurrency error")]
    OptimisticConcurrency,
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db_error) = e.as_database_error() {
            if let Some(code) = db_error.code() {
                if code == "23505" && db_error.message().contains("consent_events") {
                    return DbError::OptimisticConcurrency;
                }
            }
        }
        DbError::Db(e)
    }
}

/// Shared connection pool from which the individual backends are cloned.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: Pool<Postgres>,
}

impl PostgresBackend {
    pub async fn new(
        connect_options: PgConnectOptions,
        pool_options: PgPoolOptions,
    ) -> Result<Self, sqlx::Error> {
        let pool = pool_options.connect_with(connect_options).await?;

        Ok(Self { pool })
    }

    /// Run migrations on the database
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        Ok(())
    }

    #[must_use]
    pub fn event_store(&self) -> PostgresEventStore {
        PostgresEventStore::new(self.pool.clone())
    }

    #[must_use]
    pub fn read_models(&self) -> PostgresReadModels {
        PostgresReadModels::new(self.pool.clone())
    }

    #[must_use]
    pub fn lease_store(&self) -> PostgresLeaseStore {
        PostgresLeaseStore::new(self.pool.clone())
    }

    #[must_use]
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}
