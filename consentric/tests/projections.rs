mod common;

use std::collections::BTreeSet;

use common::helpers::{auth_context, usage_context, Harness};

use consentric::bus::{EventPayload, PublishedEvent};
use consentric::consent::{
    ConsentEvent, ConsentId, ConsentPurpose, ConsentScope, ConsentStatus, CustomerId,
    ParticipantId,
};
use consentric::event::EventMetadata;
use consentric::projection::{
    AuditTrail, ConsentViewStore, ParticipantViewStore, UsageAnalyticsStore,
};
use consentric::saga::{AuthorizeConsent, RecordUsage, RevokeConsent};
use consentric::store::EventStore;
use uuid::Uuid;

async fn full_lifecycle(harness: &Harness) -> ConsentId {
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");
    harness
        .orchestrator
        .authorize(AuthorizeConsent {
            consent_id: receipt.consent_id,
            context: auth_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to authorize consent");
    harness
        .orchestrator
        .record_usage(RecordUsage {
            consent_id: receipt.consent_id,
            context: usage_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to record usage");
    harness
        .orchestrator
        .revoke(RevokeConsent {
            consent_id: receipt.consent_id,
            reason: "customer request".to_owned(),
            correlation_id: None,
        })
        .await
        .expect("Failed to revoke consent");

    receipt.consent_id
}

#[tokio::test]
pub async fn read_model_follows_the_event_stream() {
    // Arrange & Act
    let harness = Harness::new();
    let consent_id = full_lifecycle(&harness).await;
    harness.settle().await;

    // Assert
    let view = harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");

    assert_eq!(view.status, ConsentStatus::Revoked);
    assert_eq!(view.usage_count, 1);
    assert_eq!(view.version, 4);
    assert!(view.authorized_at.is_some());
    assert!(view.revoked_at.is_some());
    assert_eq!(view.revocation_reason.as_deref(), Some("customer request"));
    assert!(view.last_used_at.is_some());

    let usage = harness
        .usage_analytics()
        .for_consent(consent_id)
        .await
        .expect("Failed to query usage analytics");
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].scope, ConsentScope::AccountInformation);

    // Folding the full history agrees with the up-to-date read-model row.
    let derived = harness
        .consents()
        .load(consent_id.as_uuid())
        .await
        .expect("Failed to load consent");
    assert_eq!(view.status, derived.state().status());
    assert_eq!(view.version, derived.version());
    assert_eq!(view.usage_count, derived.state().usage_count());
}

#[tokio::test]
pub async fn participant_directory_view_is_maintained() {
    // Arrange & Act
    let harness = Harness::new();
    harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");
    harness.settle().await;

    // Assert
    let view = harness
        .participant_views()
        .get(&ParticipantId::new("PART-456"))
        .await
        .expect("Failed to query participant view")
        .expect("Participant view should exist");
    assert_eq!(view.legal_name, "Acme Data Ltd");
    assert_eq!(view.last_validation_valid, Some(true));
    assert!(view.last_validated_at.is_some());
}

#[tokio::test]
pub async fn every_event_leaves_a_redacted_audit_entry() {
    // Arrange & Act
    let harness = Harness::new();
    let consent_id = full_lifecycle(&harness).await;
    harness.settle().await;

    // Assert
    let entries = harness
        .audit_trail()
        .entries_for(consent_id.as_uuid())
        .await
        .expect("Failed to query audit trail");
    let kinds: Vec<&str> = entries.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(entries.len(), 4);
    assert!(kinds.contains(&"ConsentCreated"));
    assert!(kinds.contains(&"ConsentAuthorized"));
    assert!(kinds.contains(&"ConsentUsed"));
    assert!(kinds.contains(&"ConsentRevoked"));

    let used = entries
        .iter()
        .find(|e| e.event_type == "ConsentUsed")
        .expect("Usage audit entry should exist");
    assert_eq!(
        used.payload["event"]["context"]["data_requested"],
        "[REDACTED]"
    );
    assert_eq!(used.payload["event"]["context"]["ip_address"], "[REDACTED]");

    let authorized = entries
        .iter()
        .find(|e| e.event_type == "ConsentAuthorized")
        .expect("Authorization audit entry should exist");
    assert_eq!(
        authorized.payload["event"]["context"]["user_agent"],
        "[REDACTED]"
    );
}

#[tokio::test]
pub async fn out_of_order_delivery_is_retried_not_dropped() {
    // Arrange: an authorization envelope whose creation has not landed yet.
    let harness = Harness::new();
    let consent_id = ConsentId::generate();
    let now = chrono::Utc::now();
    let metadata = EventMetadata::root(Uuid::new_v4());

    let created = PublishedEvent {
        aggregate_id: consent_id.as_uuid(),
        aggregate_type: "consent".to_owned(),
        sequence: 1,
        occurred_at: now,
        metadata,
        payload: EventPayload::Consent(ConsentEvent::Created {
            event_id: Uuid::new_v4(),
            consent_id,
            customer_id: CustomerId::new("CUST-9"),
            participant_id: ParticipantId::new("PART-9"),
            scopes: BTreeSet::from([ConsentScope::AccountInformation]),
            purpose: ConsentPurpose::AccountAggregation,
            created_at: now,
            expires_at: now + chrono::Duration::days(30),
        }),
    };
    let authorized = PublishedEvent {
        aggregate_id: consent_id.as_uuid(),
        aggregate_type: "consent".to_owned(),
        sequence: 2,
        occurred_at: now,
        metadata,
        payload: EventPayload::Consent(ConsentEvent::Authorized {
            event_id: Uuid::new_v4(),
            consent_id,
            context: auth_context(),
            authorized_at: now,
        }),
    };

    // Act: authorization first, then creation, then the retry pass.
    harness.handler.handle(&authorized).await;
    assert_eq!(harness.handler.pending_count(), 1);
    assert!(harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .is_none());

    harness.handler.handle(&created).await;
    harness.handler.retry_pending().await;

    // Assert
    assert_eq!(harness.handler.pending_count(), 0);
    let view = harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist after retry");
    assert_eq!(view.status, ConsentStatus::Authorized);
    assert_eq!(view.version, 2);
}

#[tokio::test]
pub async fn redelivered_events_do_not_double_apply() {
    // Arrange
    let harness = Harness::new();
    let consent_id = full_lifecycle(&harness).await;
    harness.settle().await;
    let before = harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");

    // Act: replay the whole stream through the handler a second time.
    let stored = harness
        .store
        .load(consent_id.as_uuid(), 1)
        .await
        .expect("Failed to load raw events");
    for event in &stored {
        let payload: ConsentEvent =
            serde_json::from_str(&event.payload).expect("Failed to decode payload");
        let envelope = PublishedEvent {
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type.clone(),
            sequence: event.sequence,
            occurred_at: event.occurred_at,
            metadata: event.metadata,
            payload: EventPayload::Consent(payload),
        };
        harness.handler.handle(&envelope).await;
    }

    // Assert
    let after = harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");
    assert_eq!(before, after);

    let usage = harness
        .usage_analytics()
        .for_consent(consent_id)
        .await
        .expect("Failed to query usage analytics");
    assert_eq!(usage.len(), 1);
}

#[tokio::test]
pub async fn corrupted_read_model_is_repaired_by_rebuild() {
    // Arrange
    let harness = Harness::new();
    let consent_id = full_lifecycle(&harness).await;
    harness.settle().await;

    let mut corrupted = harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");
    corrupted.status = ConsentStatus::Pending;
    corrupted.usage_count = 99;
    corrupted.version = 1;
    harness
        .views()
        .upsert(corrupted)
        .await
        .expect("Failed to corrupt read model");

    let report = harness
        .handler
        .validate_consistency(harness.store.as_ref(), harness.crypto.as_ref())
        .await
        .expect("Failed to validate consistency");
    assert!(!report.is_consistent());

    // Act
    harness
        .handler
        .rebuild_for_aggregate(
            harness.store.as_ref(),
            harness.crypto.as_ref(),
            consent_id.as_uuid(),
        )
        .await
        .expect("Failed to rebuild aggregate projections");

    // Assert: the read model matches event-derived state exactly.
    let view = harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist after rebuild");
    let derived = harness
        .consents()
        .load(consent_id.as_uuid())
        .await
        .expect("Failed to load consent");
    assert_eq!(view.status, derived.state().status());
    assert_eq!(view.usage_count, derived.state().usage_count());
    assert_eq!(view.version, derived.version());

    let report = harness
        .handler
        .validate_consistency(harness.store.as_ref(), harness.crypto.as_ref())
        .await
        .expect("Failed to validate consistency");
    assert!(report.is_consistent());
    assert_eq!(report.checked, 1);
}

#[tokio::test]
pub async fn rebuild_all_matches_incremental_application() {
    // Arrange: two consents with different histories.
    let harness = Harness::new();
    let first = full_lifecycle(&harness).await;
    let second = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent")
        .consent_id;
    harness.settle().await;

    let incremental_first = harness
        .views()
        .get(first)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");
    let incremental_second = harness
        .views()
        .get(second)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");

    // Act
    harness
        .handler
        .rebuild_all(harness.store.as_ref(), harness.crypto.as_ref())
        .await
        .expect("Failed to rebuild all projections");

    // Assert
    let rebuilt_first = harness
        .views()
        .get(first)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");
    let rebuilt_second = harness
        .views()
        .get(second)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");
    assert_eq!(incremental_first, rebuilt_first);
    assert_eq!(incremental_second, rebuilt_second);

    let report = harness
        .handler
        .validate_consistency(harness.store.as_ref(), harness.crypto.as_ref())
        .await
        .expect("Failed to validate consistency");
    assert!(report.is_consistent());
    assert_eq!(report.checked, 2);
}

#[tokio::test]
pub async fn consistency_validation_flags_orphan_rows() {
    // Arrange: a view row with no backing event stream.
    let harness = Harness::new();
    let consent_id = full_lifecycle(&harness).await;
    harness.settle().await;

    let mut orphan = harness
        .views()
        .get(consent_id)
        .await
        .expect("Failed to query read model")
        .expect("Read model row should exist");
    orphan.consent_id = ConsentId::generate();
    harness
        .views()
        .upsert(orphan)
        .await
        .expect("Failed to insert orphan row");

    // Act
    let report = harness
        .handler
        .validate_consistency(harness.store.as_ref(), harness.crypto.as_ref())
        .await
        .expect("Failed to validate consistency");

    // Assert
    assert!(!report.is_consistent());
    assert!(report
        .drift
        .iter()
        .any(|entry| entry.contains("no event stream")));
}
