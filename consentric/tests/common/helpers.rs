use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use consentric::aggregate::Context;
use consentric::bus::{EventPublisher, InMemoryBus, Priority, PublishedEvent};
use consentric::cache::InMemoryConsentCache;
use consentric::clock::ManualClock;
use consentric::consent::{
    AuthorizationContext, Consent, ConsentId, ConsentPurpose, ConsentScope, CustomerId,
    ParticipantId, UsageContext,
};
use consentric::event::EventMetadata;
use consentric::metrics::CountingMetrics;
use consentric::participant::{Participant, ParticipantRole, ParticipantValidation};
use consentric::projection::{InMemoryReadModels, ProjectionConsumer, ProjectionHandler};
use consentric::repository::Repository;
use consentric::saga::{
    ConsentOrchestrator, CreateConsent, DirectoryError, ParticipantDirectory, SagaConfig,
};
use consentric::store::{InMemoryEventStore, PlaintextCrypto};

/// How the stub directory answers validation calls.
#[derive(Debug, Clone)]
pub enum DirectoryMode {
    Valid,
    Invalid(String),
    Unavailable(String),
    /// Never answers within any sane timeout.
    Hang,
}

/// Scriptable stand-in for the external participant directory.
pub struct StubDirectory {
    mode: Mutex<DirectoryMode>,
    notify_fails: AtomicBool,
    notifications: AtomicUsize,
}

impl StubDirectory {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(DirectoryMode::Valid),
            notify_fails: AtomicBool::new(false),
            notifications: AtomicUsize::new(0),
        }
    }

    pub fn set_mode(&self, mode: DirectoryMode) {
        *self.mode.lock().expect("directory mode lock poisoned") = mode;
    }

    pub fn fail_notifications(&self) {
        self.notify_fails.store(true, Ordering::SeqCst);
    }

    pub fn notification_attempts(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParticipantDirectory for StubDirectory {
    async fn validate(
        &self,
        _id: &ParticipantId,
    ) -> Result<ParticipantValidation, DirectoryError> {
        let mode = self
            .mode
            .lock()
            .expect("directory mode lock poisoned")
            .clone();

        match mode {
            DirectoryMode::Valid => Ok(ParticipantValidation::valid(
                "Acme Data Ltd",
                ParticipantRole::DataRecipient,
            )),
            DirectoryMode::Invalid(reason) => Ok(ParticipantValidation::invalid(reason)),
            DirectoryMode::Unavailable(reason) => Err(DirectoryError::Unavailable(reason)),
            DirectoryMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("hanging directory answered")
            }
        }
    }

    async fn notify_revocation(
        &self,
        _id: &ParticipantId,
        _consent_id: ConsentId,
    ) -> Result<(), DirectoryError> {
        self.notifications.fetch_add(1, Ordering::SeqCst);

        if self.notify_fails.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable(
                "participant endpoint down".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Publisher that always fails, for exercising announce-phase isolation.
pub struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(
        &self,
        _event: PublishedEvent,
        _priority: Priority,
    ) -> Result<(), consentric::bus::PublishError> {
        Err(consentric::bus::PublishError::Unavailable(
            "bus down".to_owned(),
        ))
    }
}

pub struct HarnessOptions {
    pub config: SagaConfig,
    /// Replaces the in-memory bus as the orchestrator's publisher. The
    /// projection consumer keeps reading from the bus either way.
    pub publisher: Option<Arc<dyn EventPublisher>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        let mut config = SagaConfig::default();
        config.announce_retry.initial_backoff = Duration::from_millis(1);
        config.announce_retry.max_backoff = Duration::from_millis(5);

        Self {
            config,
            publisher: None,
        }
    }
}

/// Fully wired in-memory system under test.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryEventStore>,
    pub crypto: Arc<PlaintextCrypto>,
    pub bus: Arc<InMemoryBus>,
    pub read_models: Arc<InMemoryReadModels>,
    pub metrics: Arc<CountingMetrics>,
    pub cache: Arc<InMemoryConsentCache>,
    pub handler: Arc<ProjectionHandler>,
    pub directory: Arc<StubDirectory>,
    pub orchestrator: Arc<ConsentOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let clock = Arc::new(ManualClock::starting_at(Utc::now()));
        let store = Arc::new(InMemoryEventStore::new());
        let crypto = Arc::new(PlaintextCrypto);
        let bus = Arc::new(InMemoryBus::new());
        let read_models = Arc::new(InMemoryReadModels::new());
        let metrics = Arc::new(CountingMetrics::new());
        let cache = Arc::new(InMemoryConsentCache::new(clock.clone()));
        let directory = Arc::new(StubDirectory::new());

        let handler = Arc::new(ProjectionHandler::new(
            read_models.clone(),
            read_models.clone(),
            read_models.clone(),
            read_models.clone(),
            metrics.clone(),
        ));

        let consumer = ProjectionConsumer::new(handler.clone(), bus.subscribe());
        tokio::spawn(consumer.run());

        let publisher: Arc<dyn EventPublisher> = match options.publisher {
            Some(publisher) => publisher,
            None => bus.clone(),
        };

        let orchestrator = Arc::new(ConsentOrchestrator::new(
            Repository::<Consent>::new(store.clone(), crypto.clone()),
            Repository::<Participant>::new(store.clone(), crypto.clone()),
            directory.clone(),
            publisher,
            cache.clone(),
            metrics.clone(),
            clock.clone(),
            options.config,
        ));

        Self {
            clock,
            store,
            crypto,
            bus,
            read_models,
            metrics,
            cache,
            handler,
            directory,
            orchestrator,
        }
    }

    pub fn consents(&self) -> Repository<Consent> {
        Repository::<Consent>::new(self.store.clone(), self.crypto.clone())
    }

    pub fn views(&self) -> Arc<dyn consentric::projection::ConsentViewStore> {
        self.read_models.clone()
    }

    pub fn participant_views(&self) -> Arc<dyn consentric::projection::ParticipantViewStore> {
        self.read_models.clone()
    }

    pub fn usage_analytics(&self) -> Arc<dyn consentric::projection::UsageAnalyticsStore> {
        self.read_models.clone()
    }

    pub fn audit_trail(&self) -> Arc<dyn consentric::projection::AuditTrail> {
        self.read_models.clone()
    }

    /// Waits until the projection consumer has caught up with everything
    /// published and the lag queue is empty.
    pub async fn settle(&self) {
        for _ in 0..500 {
            if self.handler.processed_count() >= self.bus.published_count()
                && self.handler.pending_count() == 0
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        panic!(
            "projections did not settle: published {} processed {} pending {}",
            self.bus.published_count(),
            self.handler.processed_count(),
            self.handler.pending_count()
        );
    }

    pub fn create_command(&self) -> CreateConsent {
        CreateConsent {
            customer_id: CustomerId::new("CUST-123"),
            participant_id: ParticipantId::new("PART-456"),
            scopes: BTreeSet::from([ConsentScope::AccountInformation]),
            purpose: ConsentPurpose::LoanApplication,
            validity_days: Some(30),
            correlation_id: None,
        }
    }
}

pub fn auth_context() -> AuthorizationContext {
    AuthorizationContext {
        method: "SCA".to_owned(),
        ip_address: Some("203.0.113.7".to_owned()),
        user_agent: Some("test-agent/1.0".to_owned()),
    }
}

pub fn usage_context() -> UsageContext {
    UsageContext {
        scope: ConsentScope::AccountInformation,
        data_requested: "account balances".to_owned(),
        ip_address: Some("203.0.113.7".to_owned()),
    }
}

/// Builds consent aggregates directly against a repository, for store-level
/// tests that bypass the orchestrator.
pub struct ConsentBuilder {
    now: DateTime<Utc>,
    validity_days: i64,
    authorized: bool,
    usages: u32,
}

impl ConsentBuilder {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            validity_days: 30,
            authorized: false,
            usages: 0,
        }
    }

    pub fn authorized(mut self) -> Self {
        self.authorized = true;
        self
    }

    pub fn with_usages(mut self, usages: u32) -> Self {
        self.usages = usages;
        self
    }

    pub fn build(self) -> Context<Consent> {
        let metadata = EventMetadata::root(Uuid::new_v4());

        let created = Consent::create(
            ConsentId::generate(),
            CustomerId::new("CUST-123"),
            ParticipantId::new("PART-456"),
            BTreeSet::from([ConsentScope::AccountInformation]),
            ConsentPurpose::LoanApplication,
            self.now,
            Some(self.validity_days),
        )
        .expect("Failed to build creation event");

        let mut root: Context<Consent> =
            Context::record_new(created, self.now, metadata).expect("Failed to record creation");

        if self.authorized {
            let event = root
                .state()
                .authorize(auth_context(), self.now)
                .expect("Failed to build authorization event");
            root.record_that(event, self.now, metadata)
                .expect("Failed to record authorization");
        }

        for _ in 0..self.usages {
            let event = root
                .state()
                .record_usage(usage_context(), self.now)
                .expect("Failed to build usage event");
            root.record_that(event, self.now, metadata)
                .expect("Failed to record usage");
        }

        root
    }

    pub async fn save(self, repository: &Repository<Consent>) -> Context<Consent> {
        let mut root = self.build();
        repository
            .save(&mut root)
            .await
            .expect("Failed to save consent");
        root
    }
}
