//! PostgreSQL implementation of the consentric [`EventStore`].
//!
//! Ordering and concurrency control rest on the primary key over
//! (aggregate_id, sequence): the pre-flight version check catches stale
//! writers early, and the unique constraint catches the race two writers
//! can still lose between check and insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, Pool, Postgres, QueryBuilder};
use uuid::Uuid;

use consentric::event::EventMetadata;
use consentric::store::{EventStore, StoreError, StoredEvent, StoredSnapshot};
use consentric::Version;

use crate::DbError;

#[derive(Clone)]
pub struct PostgresEventStore {
    pool: Pool<Postgres>,
}

impl PostgresEventStore {
    #[must_use]
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn version_of(&self, aggregate_id: Uuid) -> Result<Version, DbError> {
        let version: i64 = query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM consent_events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await?;

        version.try_into().map_err(|_| DbError::InvalidVersionNumber)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    sequence: i64,
    event_type: String,
    payload: String,
    encrypted: bool,
    correlation_id: Uuid,
    causation_id: Uuid,
    occurred_at: DateTime<Utc>,
}

impl EventRow {
    fn into_stored(self) -> Result<StoredEvent, DbError> {
        let sequence: Version = self
            .sequence
            .try_into()
            .map_err(|_| DbError::InvalidVersionNumber)?;

        Ok(StoredEvent {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence,
            event_type: self.event_type,
            payload: self.payload,
            encrypted: self.encrypted,
            metadata: EventMetadata {
                correlation_id: self.correlation_id,
                causation_id: self.causation_id,
            },
            occurred_at: self.occurred_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    aggregate_id: Uuid,
    sequence: i64,
    snapshot_version: i32,
    state: serde_json::Value,
    created_at: DateTime<Utc>,
}

fn backend(error: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(error.to_string())
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        aggregate_id: Uuid,
        events: Vec<StoredEvent>,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        if events.is_empty() {
            return self.current_version(aggregate_id).await;
        }

        let actual = self.version_of(aggregate_id).await.map_err(backend)?;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO consent_events \
             (event_id, aggregate_id, aggregate_type, sequence, event_type, payload, \
              encrypted, correlation_id, causation_id, occurred_at) ",
        );

        let mut sequence = expected_version;
        let rows: Vec<(StoredEvent, i64)> = events
            .into_iter()
            .map(|event| {
                sequence += 1;
                (event, i64::from(sequence))
            })
            .collect();

        builder.push_values(rows, |mut b, (event, sequence)| {
            b.push_bind(event.event_id)
                .push_bind(aggregate_id)
                .push_bind(event.aggregate_type)
                .push_bind(sequence)
                .push_bind(event.event_type)
                .push_bind(event.payload)
                .push_bind(event.encrypted)
                .push_bind(event.metadata.correlation_id)
                .push_bind(event.metadata.causation_id)
                .push_bind(event.occurred_at);
        });

        let insert = builder.build().execute(&mut *tx).await.map_err(DbError::from);

        match insert {
            Ok(_) => {}
            Err(DbError::OptimisticConcurrency) => {
                drop(tx);
                let actual = self.version_of(aggregate_id).await.map_err(backend)?;
                return Err(StoreError::VersionConflict {
                    aggregate_id,
                    expected: expected_version,
                    actual,
                });
            }
            Err(error) => return Err(backend(error)),
        }

        tx.commit().await.map_err(backend)?;

        tracing::debug!(%aggregate_id, version = sequence, "events appended");
        Ok(sequence)
    }

    async fn load(
        &self,
        aggregate_id: Uuid,
        from_version: Version,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows = query_as::<_, EventRow>(
            "SELECT event_id, aggregate_id, aggregate_type, sequence, event_type, payload, \
                    encrypted, correlation_id, causation_id, occurred_at \
             FROM consent_events \
             WHERE aggregate_id = $1 AND sequence >= $2 \
             ORDER BY sequence ASC",
        )
        .bind(aggregate_id)
        .bind(i64::from(from_version))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| row.into_stored().map_err(backend))
            .collect()
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<Version, StoreError> {
        self.version_of(aggregate_id).await.map_err(backend)
    }

    async fn exists(&self, aggregate_id: Uuid) -> Result<bool, StoreError> {
        let exists: bool = query_scalar(
            "SELECT EXISTS(SELECT 1 FROM consent_events WHERE aggregate_id = $1)",
        )
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        Ok(exists)
    }

    async fn aggregate_ids(&self, aggregate_type: &str) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = query_scalar(
            "SELECT DISTINCT aggregate_id FROM consent_events \
             WHERE aggregate_type = $1 ORDER BY aggregate_id",
        )
        .bind(aggregate_type)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(ids)
    }

    async fn snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        let row = query_as::<_, SnapshotRow>(
            "SELECT aggregate_id, sequence, snapshot_version, state, created_at \
             FROM consent_snapshots WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| {
            let sequence: Version = row
                .sequence
                .try_into()
                .map_err(|_| backend(DbError::InvalidVersionNumber))?;
            let snapshot_version: u32 = row
                .snapshot_version
                .try_into()
                .map_err(|_| backend(DbError::InvalidVersionNumber))?;

            Ok(StoredSnapshot {
                aggregate_id: row.aggregate_id,
                sequence,
                snapshot_version,
                state: row.state,
                created_at: row.created_at,
            })
        })
        .transpose()
    }

    async fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), StoreError> {
        query(
            "INSERT INTO consent_snapshots (aggregate_id, sequence, snapshot_version, state, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (aggregate_id) DO UPDATE SET \
                 sequence = EXCLUDED.sequence, \
                 snapshot_version = EXCLUDED.snapshot_version, \
                 state = EXCLUDED.state, \
                 created_at = EXCLUDED.created_at",
        )
        .bind(snapshot.aggregate_id)
        .bind(i64::from(snapshot.sequence))
        .bind(i32::try_from(snapshot.snapshot_version).map_err(|_| backend(DbError::InvalidVersionNumber))?)
        .bind(snapshot.state)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }
}
