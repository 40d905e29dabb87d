//! End-to-end walk through the consent lifecycle against the in-memory
//! backends: create, authorize, use, revoke, then sweep an expired consent.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use consentric::bus::InMemoryBus;
use consentric::cache::InMemoryConsentCache;
use consentric::clock::ManualClock;
use consentric::consent::{
    AuthorizationContext, Consent, ConsentId, ConsentPurpose, ConsentScope, CustomerId,
    ParticipantId, UsageContext,
};
use consentric::metrics::CountingMetrics;
use consentric::participant::{Participant, ParticipantRole, ParticipantValidation};
use consentric::projection::{InMemoryReadModels, ProjectionConsumer, ProjectionHandler};
use consentric::repository::Repository;
use consentric::saga::{
    AuthorizeConsent, ConsentOrchestrator, CreateConsent, DirectoryError, ParticipantDirectory,
    RecordUsage, RevokeConsent, SagaConfig,
};
use consentric::store::{InMemoryEventStore, PlaintextCrypto};
use consentric::sweeper::{CleanupSweeper, InMemoryLeaseStore, SweeperConfig};

struct StaticDirectory;

#[async_trait]
impl ParticipantDirectory for StaticDirectory {
    async fn validate(
        &self,
        id: &ParticipantId,
    ) -> Result<ParticipantValidation, DirectoryError> {
        Ok(ParticipantValidation::valid(
            format!("{id} Fintech Ltd"),
            ParticipantRole::DataRecipient,
        ))
    }

    async fn notify_revocation(
        &self,
        id: &ParticipantId,
        consent_id: ConsentId,
    ) -> Result<(), DirectoryError> {
        tracing::info!(participant_id = %id, %consent_id, "participant notified of revocation");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let clock = Arc::new(ManualClock::starting_at(chrono::Utc::now()));
    let store = Arc::new(InMemoryEventStore::new());
    let crypto = Arc::new(PlaintextCrypto);
    let bus = Arc::new(InMemoryBus::new());
    let read_models = Arc::new(InMemoryReadModels::new());
    let metrics = Arc::new(CountingMetrics::new());
    let cache = Arc::new(InMemoryConsentCache::new(clock.clone()));

    let handler = Arc::new(ProjectionHandler::new(
        read_models.clone(),
        read_models.clone(),
        read_models.clone(),
        read_models.clone(),
        metrics.clone(),
    ));

    // Projections consume the bus in the background, off the command path.
    let consumer = ProjectionConsumer::new(handler.clone(), bus.subscribe());
    tokio::spawn(consumer.run());

    let orchestrator = Arc::new(ConsentOrchestrator::new(
        Repository::<Consent>::new(store.clone(), crypto.clone()),
        Repository::<Participant>::new(store.clone(), crypto.clone()),
        Arc::new(StaticDirectory),
        bus.clone(),
        cache.clone(),
        metrics.clone(),
        clock.clone(),
        SagaConfig::default(),
    ));

    // Create a consent for 30 days of account access.
    let receipt = orchestrator
        .create(CreateConsent {
            customer_id: CustomerId::new("CUST-1001"),
            participant_id: ParticipantId::new("PART-2002"),
            scopes: BTreeSet::from([
                ConsentScope::AccountInformation,
                ConsentScope::TransactionHistory,
            ]),
            purpose: ConsentPurpose::AccountAggregation,
            validity_days: Some(30),
            correlation_id: None,
        })
        .await?;
    let consent_id = receipt.consent_id;
    tracing::info!(%consent_id, status = %receipt.status, version = receipt.version, "created");

    // Authorize and use it.
    orchestrator
        .authorize(AuthorizeConsent {
            consent_id,
            context: AuthorizationContext {
                method: "SCA".to_owned(),
                ip_address: Some("198.51.100.10".to_owned()),
                user_agent: Some("demo-agent/1.0".to_owned()),
            },
            correlation_id: None,
        })
        .await?;

    let receipt = orchestrator
        .record_usage(RecordUsage {
            consent_id,
            context: UsageContext {
                scope: ConsentScope::AccountInformation,
                data_requested: "current account balances".to_owned(),
                ip_address: Some("198.51.100.10".to_owned()),
            },
            correlation_id: None,
        })
        .await?;
    tracing::info!(usage_count = receipt.usage_count, "usage recorded");

    // Revoke on customer request; the read model catches up asynchronously.
    let receipt = orchestrator
        .revoke(RevokeConsent {
            consent_id,
            reason: "customer request".to_owned(),
            correlation_id: None,
        })
        .await?;
    tracing::info!(status = %receipt.status, version = receipt.version, "revoked");

    // A second consent that the sweeper will expire.
    let short_lived = orchestrator
        .create(CreateConsent {
            customer_id: CustomerId::new("CUST-1001"),
            participant_id: ParticipantId::new("PART-2002"),
            scopes: BTreeSet::from([ConsentScope::Balances]),
            purpose: ConsentPurpose::PaymentProcessing,
            validity_days: Some(1),
            correlation_id: None,
        })
        .await?;

    let sweeper = Arc::new(CleanupSweeper::new(
        orchestrator.clone(),
        read_models.clone(),
        Arc::new(InMemoryLeaseStore::new(clock.clone())),
        clock.clone(),
        metrics.clone(),
        SweeperConfig::default(),
    ));

    // Let projections settle, then move time past the validity window.
    wait_for_projections(&bus, &handler).await;
    clock.advance(chrono::Duration::days(2));

    let report = sweeper.run_once().await;
    tracing::info!(expired = report.expired, "sweep finished");

    wait_for_projections(&bus, &handler).await;

    for view in consentric::projection::ConsentViewStore::all(read_models.as_ref()).await? {
        tracing::info!(
            consent_id = %view.consent_id,
            status = %view.status,
            usage_count = view.usage_count,
            version = view.version,
            "read model row"
        );
    }

    let swept = orchestrator.get(short_lived.consent_id).await?;
    tracing::info!(status = %swept.consent.status(), "short-lived consent after sweep");

    let report = handler
        .validate_consistency(store.as_ref(), crypto.as_ref())
        .await?;
    tracing::info!(
        checked = report.checked,
        consistent = report.consistent,
        drift = report.drift.len(),
        "consistency validated"
    );

    Ok(())
}

async fn wait_for_projections(bus: &InMemoryBus, handler: &ProjectionHandler) {
    for _ in 0..200 {
        if handler.processed_count() >= bus.published_count() && handler.pending_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::warn!("projections did not settle in time");
}
