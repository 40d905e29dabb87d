//! CQRS projections: query-optimized read models, usage analytics and the
//! audit trail, all derived from published events and rebuildable from the
//! event store at any time.
//!
//! Projection updates never run on the command path. Out-of-order delivery
//! is tolerated: an update that arrives before its row exists is queued and
//! retried instead of dropped, and updates older than the row's version are
//! ignored so redelivery is harmless.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, Context};
use crate::bus::{BusSubscription, EventPayload, PublishedEvent};
use crate::consent::{
    Consent, ConsentEvent, ConsentId, ConsentPurpose, ConsentScope, ConsentStatus, CustomerId,
    ParticipantId,
};
use crate::event::{EventMetadata, RecordedEvent};
use crate::metrics::MetricsSink;
use crate::participant::{Participant, ParticipantEvent, ParticipantRole};
use crate::store::{EventCrypto, EventStore, StoredEvent};
use crate::Version;

/// Denormalized projection of a consent's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentView {
    pub consent_id: ConsentId,
    pub customer_id: CustomerId,
    pub participant_id: ParticipantId,
    pub status: ConsentStatus,
    pub scopes: BTreeSet<ConsentScope>,
    pub purpose: ConsentPurpose,
    pub created_at: DateTime<Utc>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Sequence of the last event folded into this row.
    pub version: Version,
}

/// Directory listing of a participant, derived from its event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantDirectoryView {
    pub participant_id: ParticipantId,
    pub legal_name: String,
    pub role: ParticipantRole,
    pub last_validation_valid: Option<bool>,
    pub onboarded_at: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
}

/// One recorded data access, for usage analytics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Id of the usage event, which makes redelivered records detectable.
    pub id: Uuid,
    pub consent_id: ConsentId,
    pub participant_id: ParticipantId,
    pub scope: ConsentScope,
    pub occurred_at: DateTime<Utc>,
}

/// Redacted audit-trail entry, written for every handled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
    /// Event payload with sensitive fields masked.
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
    pub occurred_at: DateTime<Utc>,
}

/// List of possible errors that can be returned by read-model backends.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The row targeted by an update does not exist yet. This is projection
    /// lag, not data loss: the update is retried once the insert arrives.
    #[error("read-model row missing for aggregate {0}")]
    RowMissing(Uuid),

    /// The update skipped ahead of the row's version, i.e. an earlier event
    /// has not been applied yet. Retried like [`ProjectionError::RowMissing`].
    #[error("out-of-order update for aggregate {aggregate_id}: row at {at}, event at {got}")]
    OutOfOrder {
        aggregate_id: Uuid,
        at: Version,
        got: Version,
    },

    /// A stored event could not be decoded during rebuild or validation.
    #[error("failed to decode stored event: {0}")]
    Decode(String),

    /// The read-model backend failed.
    #[error("read-model backend error: {0}")]
    Backend(String),
}

/// Read-model store for [`ConsentView`] rows.
#[async_trait]
pub trait ConsentViewStore: Send + Sync {
    /// Inserts or replaces the row for `view.consent_id`.
    async fn upsert(&self, view: ConsentView) -> Result<(), ProjectionError>;

    /// Applies a status change recorded at `sequence`. Changes at or below
    /// the row's version are ignored; changes further ahead than the next
    /// sequence fail with [`ProjectionError::OutOfOrder`].
    async fn update_status(
        &self,
        consent_id: ConsentId,
        status: ConsentStatus,
        occurred_at: DateTime<Utc>,
        reason: Option<String>,
        sequence: Version,
    ) -> Result<(), ProjectionError>;

    /// Applies a usage recorded at `sequence`, incrementing the counter by
    /// exactly 1. Changes at or below the row's version are ignored.
    async fn record_usage(
        &self,
        consent_id: ConsentId,
        used_at: DateTime<Utc>,
        sequence: Version,
    ) -> Result<(), ProjectionError>;

    async fn get(&self, consent_id: ConsentId) -> Result<Option<ConsentView>, ProjectionError>;

    async fn all(&self) -> Result<Vec<ConsentView>, ProjectionError>;

    async fn by_customer(&self, customer_id: &CustomerId)
        -> Result<Vec<ConsentView>, ProjectionError>;

    async fn by_participant(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Vec<ConsentView>, ProjectionError>;

    async fn by_status(&self, status: ConsentStatus) -> Result<Vec<ConsentView>, ProjectionError>;

    async fn delete(&self, consent_id: ConsentId) -> Result<(), ProjectionError>;

    async fn truncate(&self) -> Result<(), ProjectionError>;
}

/// Read-model store for the participant directory.
#[async_trait]
pub trait ParticipantViewStore: Send + Sync {
    async fn upsert(&self, view: ParticipantDirectoryView) -> Result<(), ProjectionError>;

    /// Records a validation outcome on an existing directory row.
    async fn mark_validated(
        &self,
        participant_id: &ParticipantId,
        valid: bool,
        validated_at: DateTime<Utc>,
    ) -> Result<(), ProjectionError>;

    async fn get(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantDirectoryView>, ProjectionError>;

    async fn remove(&self, participant_id: &ParticipantId) -> Result<(), ProjectionError>;

    async fn truncate(&self) -> Result<(), ProjectionError>;
}

/// Append-only store of usage analytics records.
#[async_trait]
pub trait UsageAnalyticsStore: Send + Sync {
    /// Appends a record; a record with an already-known id is ignored.
    async fn append(&self, record: UsageRecord) -> Result<(), ProjectionError>;

    async fn for_consent(&self, consent_id: ConsentId)
        -> Result<Vec<UsageRecord>, ProjectionError>;

    async fn delete_for_consent(&self, consent_id: ConsentId) -> Result<(), ProjectionError>;

    async fn truncate(&self) -> Result<(), ProjectionError>;
}

/// Append-only audit trail, written independently of the main projections.
#[async_trait]
pub trait AuditTrail: Send + Sync {
    /// Appends an entry; an entry with an already-known event id is ignored.
    async fn append(&self, entry: AuditEntry) -> Result<(), ProjectionError>;

    async fn entries_for(&self, aggregate_id: Uuid) -> Result<Vec<AuditEntry>, ProjectionError>;

    async fn delete_for_aggregate(&self, aggregate_id: Uuid) -> Result<(), ProjectionError>;

    async fn truncate(&self) -> Result<(), ProjectionError>;
}

#[derive(Debug, Default)]
struct ReadModelState {
    views: HashMap<ConsentId, ConsentView>,
    participants: HashMap<ParticipantId, ParticipantDirectoryView>,
    usage: Vec<UsageRecord>,
    audit: Vec<AuditEntry>,
}

/// In-process read-model backend used by tests, demos and local
/// development. Implements all four projection ports.
#[derive(Debug, Default)]
pub struct InMemoryReadModels {
    state: Mutex<ReadModelState>,
}

impl InMemoryReadModels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReadModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ConsentViewStore for InMemoryReadModels {
    async fn upsert(&self, view: ConsentView) -> Result<(), ProjectionError> {
        self.lock().views.insert(view.consent_id, view);
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
        let mut state = self.lock();
        let view = state
            .views
            .get_mut(&consent_id)
            .ok_or(ProjectionError::RowMissing(consent_id.as_uuid()))?;

        if sequence <= view.version {
            return Ok(());
        }
        if sequence > view.version + 1 {
            return Err(ProjectionError::OutOfOrder {
                aggregate_id: consent_id.as_uuid(),
                at: view.version,
                got: sequence,
            });
        }

        view.status = status;
        view.version = sequence;
        match status {
            ConsentStatus::Authorized => view.authorized_at = Some(occurred_at),
            ConsentStatus::Revoked => {
                view.revoked_at = Some(occurred_at);
                view.revocation_reason = reason;
            }
            ConsentStatus::Expired | ConsentStatus::Pending => {}
        }

        Ok(())
    }

    async fn record_usage(
        &self,
        consent_id: ConsentId,
        used_at: DateTime<Utc>,
        sequence: Version,
    ) -> Result<(), ProjectionError> {
        let mut state = self.lock();
        let view = state
            .views
            .get_mut(&consent_id)
            .ok_or(ProjectionError::RowMissing(consent_id.as_uuid()))?;

        if sequence <= view.version {
            return Ok(());
        }
        if sequence > view.version + 1 {
            return Err(ProjectionError::OutOfOrder {
                aggregate_id: consent_id.as_uuid(),
                at: view.version,
                got: sequence,
            });
        }

        view.usage_count += 1;
        view.last_used_at = Some(used_at);
        view.version = sequence;

        Ok(())
    }

    async fn get(&self, consent_id: ConsentId) -> Result<Option<ConsentView>, ProjectionError> {
        Ok(self.lock().views.get(&consent_id).cloned())
    }

    async fn all(&self) -> Result<Vec<ConsentView>, ProjectionError> {
        let mut views: Vec<ConsentView> = self.lock().views.values().cloned().collect();
        views.sort_by_key(|view| view.consent_id);
        Ok(views)
    }

    async fn by_customer(
        &self,
        customer_id: &CustomerId,
    ) -> Result<Vec<ConsentView>, ProjectionError> {
        Ok(self
            .lock()
            .views
            .values()
            .filter(|view| &view.customer_id == customer_id)
            .cloned()
            .collect())
    }

    async fn by_participant(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Vec<ConsentView>, ProjectionError> {
        Ok(self
            .lock()
            .views
            .values()
            .filter(|view| &view.participant_id == participant_id)
            .cloned()
            .collect())
    }

    async fn by_status(&self, status: ConsentStatus) -> Result<Vec<ConsentView>, ProjectionError> {
        Ok(self
            .lock()
            .views
            .values()
            .filter(|view| view.status == status)
            .cloned()
            .collect())
    }

    async fn delete(&self, consent_id: ConsentId) -> Result<(), ProjectionError> {
        self.lock().views.remove(&consent_id);
        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        self.lock().views.clear();
        Ok(())
    }
}

#[async_trait]
impl ParticipantViewStore for InMemoryReadModels {
    async fn upsert(&self, view: ParticipantDirectoryView) -> Result<(), ProjectionError> {
        self.lock()
            .participants
            .insert(view.participant_id.clone(), view);
        Ok(())
    }

    async fn mark_validated(
        &self,
        participant_id: &ParticipantId,
        valid: bool,
        validated_at: DateTime<Utc>,
    ) -> Result<(), ProjectionError> {
        let mut state = self.lock();
        let view = state
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| ProjectionError::RowMissing(Participant::stream_id_for(participant_id)))?;

        view.last_validation_valid = Some(valid);
        view.last_validated_at = Some(validated_at);

        Ok(())
    }

    async fn get(
        &self,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantDirectoryView>, ProjectionError> {
        Ok(self.lock().participants.get(participant_id).cloned())
    }

    async fn remove(&self, participant_id: &ParticipantId) -> Result<(), ProjectionError> {
        self.lock().participants.remove(participant_id);
        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        self.lock().participants.clear();
        Ok(())
    }
}

#[async_trait]
impl UsageAnalyticsStore for InMemoryReadModels {
    async fn append(&self, record: UsageRecord) -> Result<(), ProjectionError> {
        let mut state = self.lock();
        if state.usage.iter().any(|existing| existing.id == record.id) {
            return Ok(());
        }
        state.usage.push(record);
        Ok(())
    }

    async fn for_consent(
        &self,
        consent_id: ConsentId,
    ) -> Result<Vec<UsageRecord>, ProjectionError> {
        Ok(self
            .lock()
            .usage
            .iter()
            .filter(|record| record.consent_id == consent_id)
            .cloned()
            .collect())
    }

    async fn delete_for_consent(&self, consent_id: ConsentId) -> Result<(), ProjectionError> {
        self.lock()
            .usage
            .retain(|record| record.consent_id != consent_id);
        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        self.lock().usage.clear();
        Ok(())
    }
}

#[async_trait]
impl AuditTrail for InMemoryReadModels {
    async fn append(&self, entry: AuditEntry) -> Result<(), ProjectionError> {
        let mut state = self.lock();
        if state
            .audit
            .iter()
            .any(|existing| existing.event_id == entry.event_id)
        {
            return Ok(());
        }
        state.audit.push(entry);
        Ok(())
    }

    async fn entries_for(&self, aggregate_id: Uuid) -> Result<Vec<AuditEntry>, ProjectionError> {
        Ok(self
            .lock()
            .audit
            .iter()
            .filter(|entry| entry.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }

    async fn delete_for_aggregate(&self, aggregate_id: Uuid) -> Result<(), ProjectionError> {
        self.lock()
            .audit
            .retain(|entry| entry.aggregate_id != aggregate_id);
        Ok(())
    }

    async fn truncate(&self) -> Result<(), ProjectionError> {
        self.lock().audit.clear();
        Ok(())
    }
}

const REDACTED_FIELDS: &[&str] = &["ip_address", "user_agent", "data_requested", "details"];

/// Masks sensitive fields before a payload enters the audit trail.
fn redact(mut value: serde_json::Value) -> serde_json::Value {
    redact_in_place(&mut value);
    value
}

fn redact_in_place(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if REDACTED_FIELDS.contains(&key.as_str()) && !entry.is_null() {
                    *entry = serde_json::Value::String("[REDACTED]".to_owned());
                } else {
                    redact_in_place(entry);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                redact_in_place(item);
            }
        }
        _ => {}
    }
}

/// Report produced by [`ProjectionHandler::validate_consistency`].
#[derive(Debug, Default)]
pub struct ConsistencyReport {
    pub checked: usize,
    pub consistent: usize,
    /// Human-readable description of every divergence found. Drift requires
    /// operator action (usually a rebuild).
    pub drift: Vec<String>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty()
    }
}

struct PendingUpdate {
    event: PublishedEvent,
    attempts: u32,
}

/// Applies published events to the read models, the usage analytics store
/// and the audit trail. One handler method per event kind, each
/// independently retryable.
pub struct ProjectionHandler {
    views: Arc<dyn ConsentViewStore>,
    participants: Arc<dyn ParticipantViewStore>,
    usage: Arc<dyn UsageAnalyticsStore>,
    audit: Arc<dyn AuditTrail>,
    metrics: Arc<dyn MetricsSink>,
    pending: Mutex<Vec<PendingUpdate>>,
    processed: AtomicU64,
}

impl ProjectionHandler {
    pub fn new(
        views: Arc<dyn ConsentViewStore>,
        participants: Arc<dyn ParticipantViewStore>,
        usage: Arc<dyn UsageAnalyticsStore>,
        audit: Arc<dyn AuditTrail>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            views,
            participants,
            usage,
            audit,
            metrics,
            pending: Mutex::new(Vec::new()),
            processed: AtomicU64::new(0),
        }
    }

    /// Number of events this handler has seen, including ones waiting in
    /// the retry queue.
    #[must_use]
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Number of updates waiting on projection lag.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Handles one published event: writes the audit entry, then applies
    /// the main projection. Never fails the caller; lagging or failing
    /// updates are queued for retry.
    pub async fn handle(&self, event: &PublishedEvent) {
        self.record_audit(event).await;

        match self.project(event).await {
            Ok(()) => {
                self.metrics.increment("projection_processed");
            }
            Err(
                error @ (ProjectionError::RowMissing(_) | ProjectionError::OutOfOrder { .. }),
            ) => {
                tracing::warn!(
                    aggregate_id = %event.aggregate_id,
                    event_type = event.event_type(),
                    %error,
                    "projection lag, scheduling retry"
                );
                self.metrics.increment("projection_lag");
                self.queue_retry(event);
            }
            Err(error) => {
                tracing::error!(
                    aggregate_id = %event.aggregate_id,
                    event_type = event.event_type(),
                    %error,
                    "projection update failed, scheduling retry"
                );
                self.metrics.increment("projection_failed");
                self.queue_retry(event);
            }
        }

        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-applies queued updates until no further progress is possible.
    /// Updates that still cannot be applied go back to the queue; nothing
    /// is ever dropped.
    pub async fn retry_pending(&self) {
        loop {
            let drained: Vec<PendingUpdate> = {
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *pending)
            };

            if drained.is_empty() {
                return;
            }

            let mut progressed = false;
            for mut update in drained {
                match self.project(&update.event).await {
                    Ok(()) => {
                        progressed = true;
                        self.metrics.increment("projection_processed");
                    }
                    Err(error) => {
                        update.attempts += 1;
                        tracing::debug!(
                            aggregate_id = %update.event.aggregate_id,
                            attempts = update.attempts,
                            %error,
                            "projection retry still failing"
                        );
                        self.pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(update);
                    }
                }
            }

            if !progressed {
                return;
            }
        }
    }

    /// Truncates every derived store and replays the full history. The
    /// result is identical to incremental application.
    ///
    /// # Errors
    ///
    /// Fails when the event store cannot be read or a stored event does not
    /// decode; partial rebuilds are left for the operator to retry.
    pub async fn rebuild_all(
        &self,
        store: &dyn EventStore,
        crypto: &dyn EventCrypto,
    ) -> Result<(), ProjectionError> {
        tracing::info!("rebuilding all read models from the event store");

        self.views.truncate().await?;
        self.participants.truncate().await?;
        self.usage.truncate().await?;
        self.audit.truncate().await?;

        for aggregate_type in [Consent::AGGREGATE_TYPE, Participant::AGGREGATE_TYPE] {
            let ids = store
                .aggregate_ids(aggregate_type)
                .await
                .map_err(|e| ProjectionError::Backend(e.to_string()))?;

            for aggregate_id in ids {
                self.replay_stream(store, crypto, aggregate_id).await?;
            }
        }

        self.metrics.increment("projection_rebuild");
        Ok(())
    }

    /// Rebuilds the derived rows of a single aggregate from its stream.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ProjectionHandler::rebuild_all`].
    pub async fn rebuild_for_aggregate(
        &self,
        store: &dyn EventStore,
        crypto: &dyn EventCrypto,
        aggregate_id: Uuid,
    ) -> Result<(), ProjectionError> {
        tracing::info!(%aggregate_id, "rebuilding read models for aggregate");

        let events = store
            .load(aggregate_id, 1)
            .await
            .map_err(|e| ProjectionError::Backend(e.to_string()))?;

        self.views.delete(ConsentId::from_uuid(aggregate_id)).await?;
        self.usage
            .delete_for_consent(ConsentId::from_uuid(aggregate_id))
            .await?;
        self.audit.delete_for_aggregate(aggregate_id).await?;

        if let Some(first) = events.first() {
            if first.aggregate_type == Participant::AGGREGATE_TYPE {
                if let Ok(published) = to_published(first, crypto) {
                    if let EventPayload::Participant(ParticipantEvent::Onboarded {
                        participant_id,
                        ..
                    }) = &published.payload
                    {
                        self.participants.remove(participant_id).await?;
                    }
                }
            }
        }

        for stored in &events {
            let published = to_published(stored, crypto)?;
            self.handle(&published).await;
        }

        Ok(())
    }

    /// Compares event-store-derived state against the read models and
    /// reports drift for operator action.
    ///
    /// # Errors
    ///
    /// Fails when the event store cannot be read or a stream cannot be
    /// folded.
    pub async fn validate_consistency(
        &self,
        store: &dyn EventStore,
        crypto: &dyn EventCrypto,
    ) -> Result<ConsistencyReport, ProjectionError> {
        let mut report = ConsistencyReport::default();

        let ids = store
            .aggregate_ids(Consent::AGGREGATE_TYPE)
            .await
            .map_err(|e| ProjectionError::Backend(e.to_string()))?;

        for aggregate_id in &ids {
            report.checked += 1;

            let derived = fold_consent(store, crypto, *aggregate_id).await?;
            let consent_id = ConsentId::from_uuid(*aggregate_id);

            match self.views.get(consent_id).await? {
                None => report
                    .drift
                    .push(format!("consent {consent_id}: read-model row missing")),
                Some(view) => {
                    let mut mismatches = Vec::new();

                    if view.status != derived.state().status() {
                        mismatches.push(format!(
                            "status {} != derived {}",
                            view.status,
                            derived.state().status()
                        ));
                    }
                    if view.version != derived.version() {
                        mismatches.push(format!(
                            "version {} != derived {}",
                            view.version,
                            derived.version()
                        ));
                    }
                    if view.usage_count != derived.state().usage_count() {
                        mismatches.push(format!(
                            "usage count {} != derived {}",
                            view.usage_count,
                            derived.state().usage_count()
                        ));
                    }

                    if mismatches.is_empty() {
                        report.consistent += 1;
                    } else {
                        report
                            .drift
                            .push(format!("consent {consent_id}: {}", mismatches.join(", ")));
                    }
                }
            }
        }

        let known: std::collections::HashSet<Uuid> = ids.into_iter().collect();
        for view in self.views.all().await? {
            if !known.contains(&view.consent_id.as_uuid()) {
                report.drift.push(format!(
                    "consent {}: read-model row has no event stream",
                    view.consent_id
                ));
            }
        }

        if !report.is_consistent() {
            tracing::warn!(
                drift = report.drift.len(),
                checked = report.checked,
                "read models have drifted from the event store"
            );
        }

        Ok(report)
    }

    async fn project(&self, event: &PublishedEvent) -> Result<(), ProjectionError> {
        match &event.payload {
            EventPayload::Consent(consent_event) => {
                self.project_consent(event, consent_event).await
            }
            EventPayload::Participant(participant_event) => {
                self.project_participant(participant_event).await
            }
        }
    }

    async fn project_consent(
        &self,
        envelope: &PublishedEvent,
        event: &ConsentEvent,
    ) -> Result<(), ProjectionError> {
        match event {
            ConsentEvent::Created {
                consent_id,
                customer_id,
                participant_id,
                scopes,
                purpose,
                created_at,
                expires_at,
                ..
            } => {
                self.views
                    .upsert(ConsentView {
                        consent_id: *consent_id,
                        customer_id: customer_id.clone(),
                        participant_id: participant_id.clone(),
                        status: ConsentStatus::Pending,
                        scopes: scopes.clone(),
                        purpose: *purpose,
                        created_at: *created_at,
                        authorized_at: None,
                        revoked_at: None,
                        revocation_reason: None,
                        expires_at: *expires_at,
                        usage_count: 0,
                        last_used_at: None,
                        version: envelope.sequence,
                    })
                    .await
            }
            ConsentEvent::Authorized {
                consent_id,
                authorized_at,
                ..
            } => {
                self.views
                    .update_status(
                        *consent_id,
                        ConsentStatus::Authorized,
                        *authorized_at,
                        None,
                        envelope.sequence,
                    )
                    .await
            }
            ConsentEvent::Revoked {
                consent_id,
                reason,
                revoked_at,
                ..
            } => {
                self.views
                    .update_status(
                        *consent_id,
                        ConsentStatus::Revoked,
                        *revoked_at,
                        Some(reason.clone()),
                        envelope.sequence,
                    )
                    .await
            }
            ConsentEvent::Used {
                event_id,
                consent_id,
                context,
                used_at,
            } => {
                let view = self
                    .views
                    .get(*consent_id)
                    .await?
                    .ok_or(ProjectionError::RowMissing(consent_id.as_uuid()))?;

                self.usage
                    .append(UsageRecord {
                        id: *event_id,
                        consent_id: *consent_id,
                        participant_id: view.participant_id.clone(),
                        scope: context.scope,
                        occurred_at: *used_at,
                    })
                    .await?;

                self.views
                    .record_usage(*consent_id, *used_at, envelope.sequence)
                    .await
            }
            ConsentEvent::Expired {
                consent_id,
                expired_at,
                ..
            } => {
                self.views
                    .update_status(
                        *consent_id,
                        ConsentStatus::Expired,
                        *expired_at,
                        None,
                        envelope.sequence,
                    )
                    .await
            }
        }
    }

    async fn project_participant(
        &self,
        event: &ParticipantEvent,
    ) -> Result<(), ProjectionError> {
        match event {
            ParticipantEvent::Onboarded {
                participant_id,
                legal_name,
                role,
                onboarded_at,
                ..
            } => {
                self.participants
                    .upsert(ParticipantDirectoryView {
                        participant_id: participant_id.clone(),
                        legal_name: legal_name.clone(),
                        role: *role,
                        last_validation_valid: None,
                        onboarded_at: *onboarded_at,
                        last_validated_at: None,
                    })
                    .await
            }
            ParticipantEvent::Validated {
                participant_id,
                valid,
                validated_at,
                ..
            } => {
                self.participants
                    .mark_validated(participant_id, *valid, *validated_at)
                    .await
            }
        }
    }

    /// Writes the audit entry for an event. Independent of the main
    /// projection: an audit failure is logged and never blocks it.
    async fn record_audit(&self, event: &PublishedEvent) {
        let payload = match serde_json::to_value(&event.payload) {
            Ok(payload) => redact(payload),
            Err(error) => {
                tracing::error!(%error, "failed to serialize audit payload");
                return;
            }
        };

        let entry = AuditEntry {
            event_id: event.payload.event_id(),
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type.clone(),
            event_type: event.event_type().to_owned(),
            payload,
            metadata: event.metadata,
            occurred_at: event.occurred_at,
        };

        if let Err(error) = self.audit.append(entry).await {
            tracing::error!(
                aggregate_id = %event.aggregate_id,
                %error,
                "failed to write audit-trail entry"
            );
        }
    }

    fn queue_retry(&self, event: &PublishedEvent) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingUpdate {
                event: event.clone(),
                attempts: 1,
            });
    }

    async fn replay_stream(
        &self,
        store: &dyn EventStore,
        crypto: &dyn EventCrypto,
        aggregate_id: Uuid,
    ) -> Result<(), ProjectionError> {
        let events = store
            .load(aggregate_id, 1)
            .await
            .map_err(|e| ProjectionError::Backend(e.to_string()))?;

        for stored in &events {
            let published = to_published(stored, crypto)?;
            self.handle(&published).await;
        }

        Ok(())
    }
}

/// Decodes a stored event back into a publishable envelope. Unknown
/// aggregate types and unknown event tags are typed decode errors.
fn to_published(
    stored: &StoredEvent,
    crypto: &dyn EventCrypto,
) -> Result<PublishedEvent, ProjectionError> {
    let payload_text = if stored.encrypted {
        crypto
            .decrypt(&stored.payload)
            .map_err(|e| ProjectionError::Backend(e.to_string()))?
    } else {
        stored.payload.clone()
    };

    let payload = match stored.aggregate_type.as_str() {
        t if t == Consent::AGGREGATE_TYPE => EventPayload::Consent(
            serde_json::from_str::<ConsentEvent>(&payload_text)
                .map_err(|e| ProjectionError::Decode(e.to_string()))?,
        ),
        t if t == Participant::AGGREGATE_TYPE => EventPayload::Participant(
            serde_json::from_str::<ParticipantEvent>(&payload_text)
                .map_err(|e| ProjectionError::Decode(e.to_string()))?,
        ),
        other => {
            return Err(ProjectionError::Decode(format!(
                "unknown aggregate type: {other}"
            )))
        }
    };

    Ok(PublishedEvent {
        aggregate_id: stored.aggregate_id,
        aggregate_type: stored.aggregate_type.clone(),
        sequence: stored.sequence,
        occurred_at: stored.occurred_at,
        metadata: stored.metadata,
        payload,
    })
}

/// Folds a consent stream back into its aggregate state.
async fn fold_consent(
    store: &dyn EventStore,
    crypto: &dyn EventCrypto,
    aggregate_id: Uuid,
) -> Result<Context<Consent>, ProjectionError> {
    let events = store
        .load(aggregate_id, 1)
        .await
        .map_err(|e| ProjectionError::Backend(e.to_string()))?;

    let mut context: Option<Context<Consent>> = None;
    for stored in &events {
        let published = to_published(stored, crypto)?;
        let EventPayload::Consent(event) = published.payload else {
            return Err(ProjectionError::Decode(format!(
                "participant event in consent stream {aggregate_id}"
            )));
        };

        let recorded = RecordedEvent {
            sequence: stored.sequence,
            occurred_at: stored.occurred_at,
            metadata: stored.metadata,
            event,
        };

        let next = match context.take() {
            None => Context::rehydrate_from(&recorded),
            Some(context) => context.apply_rehydrated_event(&recorded),
        };
        context =
            Some(next.map_err(|e| ProjectionError::Decode(format!("corrupt stream: {e}")))?);
    }

    context.ok_or_else(|| ProjectionError::Decode(format!("empty stream {aggregate_id}")))
}

/// Drains a bus subscription into a [`ProjectionHandler`]. Spawn `run` as a
/// background task; it ends when the bus is dropped.
pub struct ProjectionConsumer {
    handler: Arc<ProjectionHandler>,
    subscription: BusSubscription,
}

impl ProjectionConsumer {
    #[must_use]
    pub fn new(handler: Arc<ProjectionHandler>, subscription: BusSubscription) -> Self {
        Self {
            handler,
            subscription,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.subscription.recv().await {
            self.handler.handle(&event).await;
            self.handler.retry_pending().await;
        }

        tracing::debug!("projection consumer stopped: bus closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_masks_sensitive_fields_recursively() {
        let payload = serde_json::json!({
            "type": "ConsentUsed",
            "context": {
                "scope": "ACCOUNT_INFORMATION",
                "data_requested": "balances for account 42",
                "ip_address": "203.0.113.7",
            },
            "used_at": "2026-01-01T00:00:00Z",
        });

        let redacted = redact(payload);

        assert_eq!(redacted["context"]["data_requested"], "[REDACTED]");
        assert_eq!(redacted["context"]["ip_address"], "[REDACTED]");
        assert_eq!(redacted["context"]["scope"], "ACCOUNT_INFORMATION");
        assert_eq!(redacted["type"], "ConsentUsed");
    }
}
