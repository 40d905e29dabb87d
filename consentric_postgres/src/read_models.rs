//! PostgreSQL read-model backend implementing the four projection ports.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, Pool, Postgres};
use uuid::Uuid;

use consentric::consent::{
    ConsentId, ConsentPurpose, ConsentScope, ConsentStatus, CustomerId, ParticipantId,
};
use consentric::event::EventMetadata;
use consentric::participant::ParticipantRole;
use consentric::projection::{
    AuditEntry, AuditTrail, ConsentView, ConsentViewStore, ParticipantDirectoryView,
    ParticipantViewStore, ProjectionError, UsageAnalyticsStore, UsageRecord,
};
use consentric::Version;

#[derive(Clone)]
pub struct PostgresReadModels {
    pool: Pool<Postgres>,
}

impl PostgresReadModels {
    #[must_use]
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn backend(error: impl std::fmt::Display) -> ProjectionError {
    ProjectionError::Backend(error.to_string())
}

#[derive(Debug, sqlx::FromRow)]
struct ConsentViewRow {
    consent_id: Uuid,
    customer_id: String,
    participant_id: String,
    status: String,
    scopes: serde_json::Value,
    purpose: serde_json::Value,
    created_at: DateTime<Utc>,
    authorized_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    revocation_reason: Option<String>,
    expires_at: DateTime<Utc>,
    usage_count: i64,
    last_used_at: Option<DateTime<Utc>>,
    version: i64,
}

impl ConsentViewRow {
    fn into_view(self) -> Result<ConsentView, ProjectionError> {
        let status: ConsentStatus = self.status.parse().map_err(backend)?;
        let scopes: BTreeSet<ConsentScope> =
            serde_json::from_value(self.scopes).map_err(backend)?;
        let purpose: ConsentPurpose = serde_json::from_value(self.purpose).map_err(backend)?;
        let version: Version = self.version.try_into().map_err(backend)?;
        let usage_count: u64 = self.usage_count.try_into().map_err(backend)?;

        Ok(ConsentView {
            consent_id: ConsentId::from_uuid(self.consent_id),
            customer_id: CustomerId::new(self.customer_id),
            participant_id: ParticipantId::new(self.participant_id),
            status,
            scopes,
            purpose,
            created_at: self.created_at,
            authorized_at: self.authorized_at,
            revoked_at: self.revoked_at,
            revocation_reason: self.revocation_reason,
            expires_at: self.expires_at,
            usage_count,
            last_used_at: self.last_used_at,
            version,
        })
    }
}

const SELECT_VIEW: &str = "SELECT consent_id, customer_id, participant_id, status, scopes, \
                           purpose, created_at, authorized_at, revoked_at, revocation_reason, \
                           expires_at, usage_count, last_used_at, version FROM consent_views";

impl PostgresReadModels {
    async fn fetch_views(
        &self,
        sql: &str,
        bind: Option<String>,
    ) -> Result<Vec<ConsentView>, ProjectionError> {
        let mut q = query_as::<_, ConsentViewRow>(sql);
        if let Some(value) = bind {
            q = q.bind(value);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(backend)?;
        rows.into_iter().map(ConsentViewRow::into_view).collect()
    }

    async fn view_version(&self, consent_id: ConsentId) -> Result<Option<i64>, ProjectionError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM consent_views WHERE consent_id = $1")
                .bind(consent_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        Ok(version)
    }

    /// Explains a zero-row conditional update: duplicate delivery is fine,
    /// a missing row or a sequence gap must be retried.
    async fn stale_update(
        &self,
        consent_id: ConsentId,
        sequence: Version,
    ) -> Result<(), ProjectionError> {
        match self.view_version(consent_id).await? {
            None => Err(ProjectionError::RowMissing(consent_id.as_uuid())),
            Some(version) if version >= i64::from(sequence) => Ok(()),
            Some(version) => Err(ProjectionError::OutOfOrder {
                aggregate_id: consent_id.as_uuid(),
                at: version.try_into().map_err(backend)?,
                got: sequence,
            }),
        }
    }
}

#[async_trait]
impl ConsentViewStore for PostgresReadModels {
    async fn upsert(&self, view: ConsentView) -> Result<(), ProjectionError> {
        let scopes = serde_json::to_value(&view.scopes).map_err(backend)?;
        let purpose = serde_json::to_value(view.purpose).map_err(backend)?;

        query(
            "INSERT INTO consent_views \
             (consent_id, customer_id, participant_id, status, scopes, purpose, created_at, \
              authorized_at, revoked_at, revocation_reason, expires_at, usage_count, \
              last_used_at, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (consent_id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 authorized_at = EXCLUDED.authorized_at, \
                 revoked_at = EXCLUDED.revoked_at, \
                 revocation_reason = EXCLUDED.revocation_reason, \
                 usage_count = EXCLUDED.usage_count, \
                 last_used_at = EXCLUDED.last_used_at, \
                 version = EXCLUDED.version",
        )
        .bind(view.consent_id.as_uuid())
        .bind(view.customer_id.as_str())
        .bind(view.participant_id.as_str())
        .bind(view.status.to_string())
        .bind(scopes)
        .bind(purpose)
        .bind(view.created_at)
        .bind(view.authorized_at)
        .bind(view.revoked_at)
        .bind(view.revocation_reason)
        .bind(view.expires_at)
        .bind(i64::try_from(view.usage_count).map_err(backend)?)
        .bind(view.last_used_at)
        .bind(i64::from(view.version))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn update_status(
        &self,
        consent_id: ConsentId,
        status: ConsentStatus,
        occurred_at: DateTime<Utc>,
        reason: Option<String>,
        sequence: Version,
    ) -> Result<(), ProjectionError> {
        let result = query(
            "UPDATE consent_views SET \
                 status = $2, \
                 version = $3, \
                 authorized_at = CASE WHEN $2 = 'AUTHORIZED' THEN $4 ELSE authorized_at END, \
                 revoked_at = CASE WHEN $2 = 'REVOKED' THEN $4 ELSE revoked_at END, \
                 revocation_reason = CASE WHEN $2 = 'REVOKED' THEN $5 ELSE revocation_reason END \
             WHERE consent_id = $1 AND version = $3 - 1",
        )
        .bind(consent_id.as_uuid())
        .bind(status.to_string())
        .bind(i64::from(sequence))
        .bind(occurred_at)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return self.stale_update(consent_id, sequence).await;
        }

        Ok(())
    }

    async fn record_usage(
        &self,
        consent_id: ConsentId,
        used_at: DateTime<Utc>,
        sequence: Version,
    ) -> Result<(), ProjectionError> {
        let result = query(
            "UPDATE consent_views SET \
                 usage_count = usage_count + 1, \
                 last_used_at = $2, \
                 version = $3 \
             WHERE consent_id = $1 AND version = $3 - 1",
        )
        .bind(consent_id.as_uuid())
        .bind(used_at)
        .bind(i64::from(sequence))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return self.stale_update(consent_id, sequence).await;
        }

        Ok(())
    }

    async fn get(&self, consent_id: ConsentId) -> Result<Option<ConsentView>, ProjectionError> {
        let row = query_as::<_, ConsentViewRow>(&format!("{SELECT_VIEW} WHERE consent_id = $1"))
            .bind(consent_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(ConsentViewRow::into_view).transpose()
    }

    async fn all(&self) -> Result<Vec<ConsentView>, ProjectionError> {
        self.fetch_views(&format!("{SELECT_VIEW} ORDER BY consent_id"), None)
            .await
    }

    async fn by_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<ConsentView>, ProjectionError> {
        self.fetch_views(
            &format!("{SELECT_VIEW} WHERE customer_id = $1"),
            Some(customer_id.as_str().to_owned()),
        )
        .await
    }

    async fn by_participant(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Vec<ConsentView>, ProjectionError> {
        self.fetch_views(
            &format!("{SELECT_VIEW} WHERE participant_id = $1"),
            Some(participant_id.as_str().to_owned()),
        )
        .await
    }

    async fn by_status(&self, status: ConsentStatus) -> Result<Vec<ConsentView>, ProjectionError> {
        self.fetch_views(
            &format!("{SELECT_VIEW} WHERE status = $1"),
            Some(status.to_string()),
        )
        .await
    }

    async fn delete(&self, consent_id: ConsentId) -> Result<(), ProjectionError> {
        query("DELETE FROM consent_views WHERE consent_id = $1")
            .bind(consent_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        query("TRUNCATE consent_views")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ParticipantViewRow {
    participant_id: String,
    legal_name: String,
    role: serde_json::Value,
    last_validation_valid: Option<bool>,
    onboarded_at: DateTime<Utc>,
    last_validated_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl ParticipantViewStore for PostgresReadModels {
    async fn upsert(&self, view: ParticipantDirectoryView) -> Result<(), ProjectionError> {
        let role = serde_json::to_value(view.role).map_err(backend)?;

        query(
            "INSERT INTO participant_views \
             (participant_id, legal_name, role, last_validation_valid, onboarded_at, last_validated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (participant_id) DO UPDATE SET \
                 legal_name = EXCLUDED.legal_name, \
                 role = EXCLUDED.role, \
                 last_validation_valid = EXCLUDED.last_validation_valid, \
                 last_validated_at = EXCLUDED.last_validated_at",
        )
        .bind(view.participant_id.as_str())
        .bind(view.legal_name)
        .bind(role)
        .bind(view.last_validation_valid)
        .bind(view.onboarded_at)
        .bind(view.last_validated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn mark_validated(
        &self,
        participant_id: &ParticipantId,
        valid: bool,
        validated_at: DateTime<Utc>,
    ) -> Result<(), ProjectionError> {
        let result = query(
            "UPDATE participant_views SET last_validation_valid = $2, last_validated_at = $3 \
             WHERE participant_id = $1",
        )
        .bind(participant_id.as_str())
        .bind(valid)
        .bind(validated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(ProjectionError::RowMissing(
                consentric::participant::Participant::stream_id_for(participant_id),
            ));
        }

        Ok(())
    }

    async fn get(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantDirectoryView>, ProjectionError> {
        let row = query_as::<_, ParticipantViewRow>(
            "SELECT participant_id, legal_name, role, last_validation_valid, onboarded_at, \
                    last_validated_at \
             FROM participant_views WHERE participant_id = $1",
        )
        .bind(participant_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.map(|row| {
            let role: ParticipantRole = serde_json::from_value(row.role).map_err(backend)?;

            Ok(ParticipantDirectoryView {
                participant_id: ParticipantId::new(row.participant_id),
                legal_name: row.legal_name,
                role,
                last_validation_valid: row.last_validation_valid,
                onboarded_at: row.onboarded_at,
                last_validated_at: row.last_validated_at,
            })
        })
        .transpose()
    }

    async fn remove(&self, participant_id: &ParticipantId) -> Result<(), ProjectionError> {
        query("DELETE FROM participant_views WHERE participant_id = $1")
            .bind(participant_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        query("TRUNCATE participant_views")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    id: Uuid,
    consent_id: Uuid,
    participant_id: String,
    scope: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

#[async_trait]
impl UsageAnalyticsStore for PostgresReadModels {
    async fn append(&self, record: UsageRecord) -> Result<(), ProjectionError> {
        let scope = serde_json::to_value(record.scope).map_err(backend)?;

        query(
            "INSERT INTO consent_usage (id, consent_id, participant_id, scope, occurred_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(record.id)
        .bind(record.consent_id.as_uuid())
        .bind(record.participant_id.as_str())
        .bind(scope)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn for_consent(
        &self,
        consent_id: ConsentId,
    ) -> Result<Vec<UsageRecord>, ProjectionError> {
        let rows = query_as::<_, UsageRow>(
            "SELECT id, consent_id, participant_id, scope, occurred_at \
             FROM consent_usage WHERE consent_id = $1 ORDER BY occurred_at ASC",
        )
        .bind(consent_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let scope: ConsentScope = serde_json::from_value(row.scope).map_err(backend)?;

                Ok(UsageRecord {
                    id: row.id,
                    consent_id: ConsentId::from_uuid(row.consent_id),
                    participant_id: ParticipantId::new(row.participant_id),
                    scope,
                    occurred_at: row.occurred_at,
                })
            })
            .collect()
    }

    async fn delete_for_consent(&self, consent_id: ConsentId) -> Result<(), ProjectionError> {
        query("DELETE FROM consent_usage WHERE consent_id = $1")
            .bind(consent_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        query("TRUNCATE consent_usage")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    event_id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    event_type: String,
    payload: serde_json::Value,
    correlation_id: Uuid,
    causation_id: Uuid,
    occurred_at: DateTime<Utc>,
}

#[async_trait]
impl AuditTrail for PostgresReadModels {
    async fn append(&self, entry: AuditEntry) -> Result<(), ProjectionError> {
        query(
            "INSERT INTO consent_audit \
             (event_id, aggregate_id, aggregate_type, event_type, payload, correlation_id, \
              causation_id, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(entry.event_id)
        .bind(entry.aggregate_id)
        .bind(entry.aggregate_type)
        .bind(entry.event_type)
        .bind(entry.payload)
        .bind(entry.metadata.correlation_id)
        .bind(entry.metadata.causation_id)
        .bind(entry.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn entries_for(&self, aggregate_id: Uuid) -> Result<Vec<AuditEntry>, ProjectionError> {
        let rows = query_as::<_, AuditRow>(
            "SELECT event_id, aggregate_id, aggregate_type, event_type, payload, \
                    correlation_id, causation_id, occurred_at \
             FROM consent_audit WHERE aggregate_id = $1 ORDER BY occurred_at ASC",
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(|row| AuditEntry {
                event_id: row.event_id,
                aggregate_id: row.aggregate_id,
                aggregate_type: row.aggregate_type,
                event_type: row.event_type,
                payload: row.payload,
                metadata: EventMetadata {
                    correlation_id: row.correlation_id,
                    causation_id: row.causation_id,
                },
                occurred_at: row.occurred_at,
            })
            .collect())
    }

    async fn delete_for_aggregate(&self, aggregate_id: Uuid) -> Result<(), ProjectionError> {
        query("DELETE FROM consent_audit WHERE aggregate_id = $1")
            .bind(aggregate_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        query("TRUNCATE consent_audit")
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(())
    }
}
