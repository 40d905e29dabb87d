//! Command orchestration across the participant directory, the event store,
//! and fan-out publication.
//!
//! Every command runs in two explicit phases with opposite failure
//! policies:
//!
//! - **decide** — validation, directory calls and the event-store append.
//!   Any failure here aborts the command before anything is persisted (or
//!   surfaces a version conflict after losing the optimistic race). Nothing
//!   to compensate.
//! - **announce** — publication, cache maintenance, participant
//!   notification, metrics. Once the append succeeded the command *has*
//!   happened; announce steps are retried with backoff and their failures
//!   are logged, never propagated.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::{Aggregate, Context};
use crate::bus::{retry_with_backoff, EventPayload, EventPublisher, Priority, PublishedEvent, RetryPolicy};
use crate::cache::{CachedConsent, ConsentCache};
use crate::clock::Clock;
use crate::consent::{
    AuthorizationContext, Consent, ConsentApplyError, ConsentError, ConsentId, ConsentPurpose,
    ConsentScope,
    ConsentStatus, CustomerId, ParticipantId, UsageContext,
};
use crate::event::{DomainEvent, EventMetadata};
use crate::metrics::MetricsSink;
use crate::participant::{Participant, ParticipantRole, ParticipantValidation};
use crate::repository::{Repository, RepositoryError, SaveError};
use crate::store::StoreError;
use crate::Version;

/// Errors returned by the external participant-directory service.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("participant directory unavailable: {0}")]
    Unavailable(String),

    #[error("participant rejected by directory: {0}")]
    Rejected(String),
}

/// External participant-directory collaborator.
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    /// Validates that a participant is registered and in good standing.
    async fn validate(&self, id: &ParticipantId) -> Result<ParticipantValidation, DirectoryError>;

    /// Notifies the owning participant that a consent was revoked.
    async fn notify_revocation(
        &self,
        id: &ParticipantId,
        consent_id: ConsentId,
    ) -> Result<(), DirectoryError>;
}

/// Request to create a new consent.
#[derive(Debug, Clone)]
pub struct CreateConsent {
    pub customer_id: CustomerId,
    pub participant_id: ParticipantId,
    pub scopes: BTreeSet<ConsentScope>,
    pub purpose: ConsentPurpose,
    /// Requested validity window in days; defaults to the purpose's
    /// recommendation and is capped at the global maximum.
    pub validity_days: Option<i64>,
    pub correlation_id: Option<Uuid>,
}

/// Request to authorize a pending consent.
#[derive(Debug, Clone)]
pub struct AuthorizeConsent {
    pub consent_id: ConsentId,
    pub context: AuthorizationContext,
    pub correlation_id: Option<Uuid>,
}

/// Request to revoke a consent.
#[derive(Debug, Clone)]
pub struct RevokeConsent {
    pub consent_id: ConsentId,
    pub reason: String,
    pub correlation_id: Option<Uuid>,
}

/// Request to record one data access against an authorized consent.
#[derive(Debug, Clone)]
pub struct RecordUsage {
    pub consent_id: ConsentId,
    pub context: UsageContext,
    pub correlation_id: Option<Uuid>,
}

/// What the caller gets back once a command has committed.
#[derive(Debug, Clone)]
pub struct ConsentReceipt {
    pub consent_id: ConsentId,
    pub status: ConsentStatus,
    pub version: Version,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub usage_count: u64,
}

impl ConsentReceipt {
    fn from_context(root: &Context<Consent>) -> Self {
        let state = root.state();
        Self {
            consent_id: state.id(),
            status: state.status(),
            version: root.version(),
            expires_at: state.expires_at(),
            usage_count: state.usage_count(),
        }
    }
}

/// Errors surfaced to command callers.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Bad input; nothing was persisted.
    #[error("invalid command: {0}")]
    Validation(String),

    /// A business rule rejected the transition; retrying with the same
    /// input will fail again.
    #[error(transparent)]
    Consent(ConsentError),

    /// The external directory rejected the participant or was unreachable.
    /// Retryable.
    #[error("participant validation failed: {0}")]
    ParticipantValidation(String),

    #[error("consent {0} not found")]
    NotFound(ConsentId),

    /// Lost the optimistic-concurrency race; reload and retry.
    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: Version, actual: Version },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ConsentError> for CommandError {
    fn from(error: ConsentError) -> Self {
        match error {
            ConsentError::Validation(message) => CommandError::Validation(message),
            other => CommandError::Consent(other),
        }
    }
}

impl From<SaveError> for CommandError {
    fn from(error: SaveError) -> Self {
        match error {
            SaveError::Store(StoreError::VersionConflict {
                expected, actual, ..
            }) => CommandError::VersionConflict { expected, actual },
            other => CommandError::Internal(other.to_string()),
        }
    }
}

/// Saga tuning knobs.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// A directory call slower than this resolves to a creation failure,
    /// never an indefinite block.
    pub directory_timeout: Duration,
    pub announce_retry: RetryPolicy,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            directory_timeout: Duration::from_secs(5),
            announce_retry: RetryPolicy::default(),
        }
    }
}

/// Per-stream command locks for invariants that span a read-modify-append
/// sequence.
#[derive(Default)]
struct StreamLocks {
    inner: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl StreamLocks {
    fn for_stream(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id).or_default())
    }
}

/// Everything queued for the announce phase of one command.
struct Announce {
    events: Vec<PublishedEvent>,
    priority: Priority,
    evict: Option<ConsentId>,
    cache_update: Option<(Consent, Version)>,
    notify: Option<(ParticipantId, ConsentId)>,
    metric: &'static str,
}

/// Coordinates consent commands across the directory, the event store and
/// fan-out.
pub struct ConsentOrchestrator {
    consents: Repository<Consent>,
    participants: Repository<Participant>,
    directory: Arc<dyn ParticipantDirectory>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<dyn ConsentCache>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    config: SagaConfig,
    command_locks: StreamLocks,
}

impl ConsentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consents: Repository<Consent>,
        participants: Repository<Participant>,
        directory: Arc<dyn ParticipantDirectory>,
        publisher: Arc<dyn EventPublisher>,
        cache: Arc<dyn ConsentCache>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        config: SagaConfig,
    ) -> Self {
        Self {
            consents,
            participants,
            directory,
            publisher,
            cache,
            metrics,
            clock,
            config,
            command_locks: StreamLocks::default(),
        }
    }

    /// Creates a new consent in Pending state.
    ///
    /// # Errors
    ///
    /// Fails with [`CommandError::Validation`] on malformed input and
    /// [`CommandError::ParticipantValidation`] when the directory rejects,
    /// errors or times out — in both cases nothing has been persisted.
    pub async fn create(&self, cmd: CreateConsent) -> Result<ConsentReceipt, CommandError> {
        Self::validate_create(&cmd)?;

        let correlation_id = cmd.correlation_id.unwrap_or_else(Uuid::new_v4);
        let metadata = EventMetadata::root(correlation_id);

        let validation = self.validate_participant(&cmd.participant_id).await?;
        let now = self.clock.now();

        let mut events = self
            .record_participant_contact(&cmd.participant_id, &validation, metadata)
            .await;

        let created = Consent::create(
            ConsentId::generate(),
            cmd.customer_id,
            cmd.participant_id,
            cmd.scopes,
            cmd.purpose,
            now,
            cmd.validity_days,
        )?;

        let mut root = Context::record_new(created, now, metadata)
            .map_err(|e: ConsentApplyError| CommandError::Internal(e.to_string()))?;

        events.extend(Self::published(&root));
        self.consents.save(&mut root).await?;

        tracing::info!(
            consent_id = %root.state().id(),
            customer_id = %root.state().customer_id(),
            participant_id = %root.state().participant_id(),
            "consent created"
        );

        self.announce(Announce {
            events,
            priority: Priority::Normal,
            evict: None,
            cache_update: Some((root.state().clone(), root.version())),
            notify: None,
            metric: "consent_created",
        })
        .await;

        Ok(ConsentReceipt::from_context(&root))
    }

    /// Authorizes a pending consent.
    ///
    /// # Errors
    ///
    /// Fails with [`CommandError::Consent`] when the consent is not
    /// Pending, and with [`CommandError::VersionConflict`] after losing a
    /// concurrent race on the same stream.
    pub async fn authorize(&self, cmd: AuthorizeConsent) -> Result<ConsentReceipt, CommandError> {
        let metadata = EventMetadata::root(cmd.correlation_id.unwrap_or_else(Uuid::new_v4));
        let now = self.clock.now();

        let mut root = self.load_consent(cmd.consent_id).await?;
        let event = root.state().authorize(cmd.context, now)?;
        root.record_that(event, now, metadata)
            .map_err(|e| CommandError::Internal(e.to_string()))?;

        let events = Self::published(&root);
        self.consents.save(&mut root).await?;

        tracing::info!(consent_id = %cmd.consent_id, "consent authorized");

        self.announce(Announce {
            events,
            priority: Priority::Normal,
            evict: None,
            cache_update: Some((root.state().clone(), root.version())),
            notify: None,
            metric: "consent_authorized",
        })
        .await;

        Ok(ConsentReceipt::from_context(&root))
    }

    /// Revokes a consent and propagates the revocation ahead of ordinary
    /// traffic. The cache entry is evicted unconditionally, even when the
    /// participant notification fails.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::AlreadyRevoked`] inside
    /// [`CommandError::Consent`] when revocation already happened.
    pub async fn revoke(&self, cmd: RevokeConsent) -> Result<ConsentReceipt, CommandError> {
        let metadata = EventMetadata::root(cmd.correlation_id.unwrap_or_else(Uuid::new_v4));
        let now = self.clock.now();

        let mut root = self.load_consent(cmd.consent_id).await?;
        let event = root.state().revoke(cmd.reason, now)?;
        root.record_that(event, now, metadata)
            .map_err(|e| CommandError::Internal(e.to_string()))?;

        let events = Self::published(&root);
        let participant_id = root.state().participant_id().clone();
        self.consents.save(&mut root).await?;

        tracing::info!(consent_id = %cmd.consent_id, "consent revoked");

        self.announce(Announce {
            events,
            priority: Priority::High,
            evict: Some(cmd.consent_id),
            cache_update: None,
            notify: Some((participant_id, cmd.consent_id)),
            metric: "consent_revoked",
        })
        .await;

        Ok(ConsentReceipt::from_context(&root))
    }

    /// Records one data access against an authorized consent.
    ///
    /// The whole read-modify-append sequence runs under the per-stream
    /// command lock, so cross-call invariants (cumulative usage) cannot
    /// depend on timing: simultaneous submissions are admitted one at a
    /// time and each sees the usage recorded before it.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::ConsentNotActive`] inside
    /// [`CommandError::Consent`] unless the consent is Authorized and
    /// unexpired.
    pub async fn record_usage(&self, cmd: RecordUsage) -> Result<ConsentReceipt, CommandError> {
        let metadata = EventMetadata::root(cmd.correlation_id.unwrap_or_else(Uuid::new_v4));

        let lock = self.command_locks.for_stream(cmd.consent_id.as_uuid());
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let mut root = self.load_consent_uncached(cmd.consent_id).await?;
        let event = root.state().record_usage(cmd.context, now)?;
        root.record_that(event, now, metadata)
            .map_err(|e| CommandError::Internal(e.to_string()))?;

        let events = Self::published(&root);
        self.consents.save(&mut root).await?;

        self.announce(Announce {
            events,
            priority: Priority::Normal,
            evict: None,
            cache_update: Some((root.state().clone(), root.version())),
            notify: None,
            metric: "consent_used",
        })
        .await;

        Ok(ConsentReceipt::from_context(&root))
    }

    /// Drives an overdue consent through the normal expiry event path.
    /// Used by the cleanup sweeper; read models are never edited directly.
    ///
    /// # Errors
    ///
    /// Fails with [`CommandError::Consent`] when the consent is already
    /// terminal and with [`CommandError::Validation`] when it has not
    /// actually expired yet (e.g. the sweep ran off a lagging read model).
    pub async fn expire(&self, consent_id: ConsentId) -> Result<ConsentReceipt, CommandError> {
        let metadata = EventMetadata::root(Uuid::new_v4());
        let now = self.clock.now();

        let mut root = self.load_consent_uncached(consent_id).await?;
        let event = root.state().expire(now)?;
        root.record_that(event, now, metadata)
            .map_err(|e| CommandError::Internal(e.to_string()))?;

        let events = Self::published(&root);
        self.consents.save(&mut root).await?;

        tracing::info!(consent_id = %consent_id, "consent expired");

        self.announce(Announce {
            events,
            priority: Priority::Normal,
            evict: Some(consent_id),
            cache_update: None,
            notify: None,
            metric: "consent_expired",
        })
        .await;

        Ok(ConsentReceipt::from_context(&root))
    }

    /// Reads a consent through the cache, falling back to event-store
    /// replay.
    ///
    /// # Errors
    ///
    /// Fails with [`CommandError::NotFound`] when no stream exists.
    pub async fn get(&self, consent_id: ConsentId) -> Result<CachedConsent, CommandError> {
        if let Some(cached) = self.cache.get(consent_id).await {
            return Ok(cached);
        }

        let root = self.load_consent_uncached(consent_id).await?;
        let cached = CachedConsent {
            consent: root.state().clone(),
            version: root.version(),
        };
        self.cache.put(&cached.consent, cached.version).await;

        Ok(cached)
    }

    fn validate_create(cmd: &CreateConsent) -> Result<(), CommandError> {
        if cmd.customer_id.as_str().trim().is_empty() {
            return Err(CommandError::Validation(
                "customer id cannot be empty".to_owned(),
            ));
        }

        if cmd.participant_id.as_str().trim().is_empty() {
            return Err(CommandError::Validation(
                "participant id cannot be empty".to_owned(),
            ));
        }

        if cmd.scopes.is_empty() {
            return Err(CommandError::Validation(
                "consent scopes cannot be empty".to_owned(),
            ));
        }

        if cmd.validity_days.is_some_and(|days| days < 1) {
            return Err(CommandError::Validation(
                "validity days must be positive".to_owned(),
            ));
        }

        Ok(())
    }

    async fn validate_participant(
        &self,
        id: &ParticipantId,
    ) -> Result<ParticipantValidation, CommandError> {
        let answer =
            tokio::time::timeout(self.config.directory_timeout, self.directory.validate(id)).await;

        match answer {
            Err(_elapsed) => Err(CommandError::ParticipantValidation(format!(
                "directory validation timed out for participant {id}"
            ))),
            Ok(Err(error)) => Err(CommandError::ParticipantValidation(error.to_string())),
            Ok(Ok(validation)) if !validation.valid => {
                Err(CommandError::ParticipantValidation(
                    validation
                        .reason
                        .unwrap_or_else(|| "participant rejected by directory".to_owned()),
                ))
            }
            Ok(Ok(validation)) => Ok(validation),
        }
    }

    /// Records the directory's answer on the participant's own stream.
    /// Directory bookkeeping must never block consent creation, so every
    /// failure path degrades to an empty event list with a warning.
    async fn record_participant_contact(
        &self,
        id: &ParticipantId,
        validation: &ParticipantValidation,
        metadata: EventMetadata,
    ) -> Vec<PublishedEvent> {
        let stream_id = Participant::stream_id_for(id);

        for _attempt in 0..3 {
            let now = self.clock.now();

            let mut root = match self.participants.load(stream_id).await {
                Ok(root) => root,
                Err(RepositoryError::AggregateNotFound) => {
                    let legal_name = validation
                        .legal_name
                        .clone()
                        .unwrap_or_else(|| id.to_string());
                    let role = validation.role.unwrap_or(ParticipantRole::DataRecipient);
                    let onboarded = Participant::onboard(id.clone(), legal_name, role, now);

                    match Context::record_new(onboarded, now, metadata) {
                        Ok(root) => root,
                        Err(error) => {
                            tracing::warn!(participant_id = %id, ?error, "participant onboarding failed");
                            return Vec::new();
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(participant_id = %id, %error, "participant stream load failed");
                    return Vec::new();
                }
            };

            let validated = root.state().record_validation(
                validation.valid,
                validation.reason.clone(),
                now,
            );
            if let Err(error) = root.record_that(validated, now, metadata) {
                tracing::warn!(participant_id = %id, ?error, "participant validation record failed");
                return Vec::new();
            }

            let events = Self::published(&root);
            match self.participants.save(&mut root).await {
                Ok(()) => return events,
                Err(error) if error.is_version_conflict() => continue,
                Err(error) => {
                    tracing::warn!(participant_id = %id, %error, "participant stream save failed");
                    return Vec::new();
                }
            }
        }

        tracing::warn!(participant_id = %id, "participant bookkeeping kept losing the stream race");
        Vec::new()
    }

    async fn load_consent(&self, id: ConsentId) -> Result<Context<Consent>, CommandError> {
        if let Some(cached) = self.cache.get(id).await {
            return Ok(Context::restore(cached.consent, cached.version));
        }

        self.load_consent_uncached(id).await
    }

    async fn load_consent_uncached(
        &self,
        id: ConsentId,
    ) -> Result<Context<Consent>, CommandError> {
        self.consents.load(id.as_uuid()).await.map_err(|e| match e {
            RepositoryError::AggregateNotFound => CommandError::NotFound(id),
            other => CommandError::Internal(other.to_string()),
        })
    }

    fn published<T>(root: &Context<T>) -> Vec<PublishedEvent>
    where
        T: Aggregate,
        T::DomainEvent: DomainEvent + Into<EventPayload>,
    {
        root.uncommitted_events()
            .iter()
            .map(|recorded| {
                PublishedEvent::from_recorded(T::AGGREGATE_TYPE, root.stream_id(), recorded)
            })
            .collect()
    }

    /// The non-transactional phase: best-effort, retried, never rolls back
    /// the committed events.
    async fn announce(&self, plan: Announce) {
        if let Some(consent_id) = plan.evict {
            self.cache.invalidate(consent_id).await;
        }

        for event in plan.events {
            let outcome = retry_with_backoff(
                || self.publisher.publish(event.clone(), plan.priority),
                &self.config.announce_retry,
                "publish_event",
            )
            .await;

            if let Err(error) = outcome {
                tracing::error!(
                    aggregate_id = %event.aggregate_id,
                    event_type = event.event_type(),
                    %error,
                    "event publication failed; projections will catch up on rebuild"
                );
            }
        }

        if let Some((consent, version)) = plan.cache_update {
            self.cache.put(&consent, version).await;
        }

        if let Some((participant_id, consent_id)) = plan.notify {
            let outcome = retry_with_backoff(
                || self.directory.notify_revocation(&participant_id, consent_id),
                &self.config.announce_retry,
                "notify_revocation",
            )
            .await;

            if let Err(error) = outcome {
                tracing::error!(
                    participant_id = %participant_id,
                    consent_id = %consent_id,
                    %error,
                    "participant revocation notification failed"
                );
            }
        }

        self.metrics.increment(plan.metric);
    }
}
