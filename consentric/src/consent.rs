//! The Consent aggregate: a customer's authorization for one participant to
//! access data under a set of scopes, derived entirely from its event
//! history.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::event::DomainEvent;

/// Consents never remain valid longer than this, regardless of what was
/// requested.
pub const MAX_VALIDITY_DAYS: i64 = 90;

/// Opaque, globally unique consent identifier. Never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConsentId(Uuid);

impl ConsentId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ConsentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of the customer granting the consent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(String);

impl CustomerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of the participant platform the data is shared with, as issued
/// by the participant directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The data categories a consent can grant access to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentScope {
    AccountInformation,
    TransactionHistory,
    Balances,
    PaymentInitiation,
    ProductDetails,
}

/// Why the data is being shared. Each purpose carries a recommended validity
/// used when the request does not name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentPurpose {
    AccountAggregation,
    LoanApplication,
    PaymentProcessing,
    FinancialAdvice,
}

impl ConsentPurpose {
    /// Recommended validity window, in days.
    #[must_use]
    pub fn recommended_validity_days(&self) -> i64 {
        match self {
            ConsentPurpose::AccountAggregation => 90,
            ConsentPurpose::LoanApplication => 30,
            ConsentPurpose::PaymentProcessing => 7,
            ConsentPurpose::FinancialAdvice => 60,
        }
    }
}

/// Lifecycle status of a consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentStatus {
    Pending,
    Authorized,
    Revoked,
    Expired,
}

impl ConsentStatus {
    /// Revoked and Expired consents never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsentStatus::Revoked | ConsentStatus::Expired)
    }
}

impl fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsentStatus::Pending => "PENDING",
            ConsentStatus::Authorized => "AUTHORIZED",
            ConsentStatus::Revoked => "REVOKED",
            ConsentStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ConsentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ConsentStatus::Pending),
            "AUTHORIZED" => Ok(ConsentStatus::Authorized),
            "REVOKED" => Ok(ConsentStatus::Revoked),
            "EXPIRED" => Ok(ConsentStatus::Expired),
            other => Err(format!("unknown consent status: {other}")),
        }
    }
}

/// Where and how an authorization was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationContext {
    /// How the customer authenticated, e.g. "SCA" or "REDIRECT".
    pub method: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// What a recorded usage accessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageContext {
    pub scope: ConsentScope,
    /// Description of the data that was requested.
    pub data_requested: String,
    pub ip_address: Option<String>,
}

/// The closed set of events a consent stream can contain.
///
/// Decoding a payload whose `type` tag is not one of these variants is a
/// typed decode error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConsentEvent {
    Created {
        event_id: Uuid,
        consent_id: ConsentId,
        customer_id: CustomerId,
        participant_id: ParticipantId,
        scopes: BTreeSet<ConsentScope>,
        purpose: ConsentPurpose,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    Authorized {
        event_id: Uuid,
        consent_id: ConsentId,
        context: AuthorizationContext,
        authorized_at: DateTime<Utc>,
    },
    Revoked {
        event_id: Uuid,
        consent_id: ConsentId,
        reason: String,
        revoked_at: DateTime<Utc>,
    },
    Used {
        event_id: Uuid,
        consent_id: ConsentId,
        context: UsageContext,
        used_at: DateTime<Utc>,
    },
    Expired {
        event_id: Uuid,
        consent_id: ConsentId,
        expired_at: DateTime<Utc>,
    },
}

impl DomainEvent for ConsentEvent {
    fn event_id(&self) -> Uuid {
        match self {
            ConsentEvent::Created { event_id, .. }
            | ConsentEvent::Authorized { event_id, .. }
            | ConsentEvent::Revoked { event_id, .. }
            | ConsentEvent::Used { event_id, .. }
            | ConsentEvent::Expired { event_id, .. } => *event_id,
        }
    }

    fn event_type(&self) -> &'static str {
        match self {
            ConsentEvent::Created { .. } => "ConsentCreated",
            ConsentEvent::Authorized { .. } => "ConsentAuthorized",
            ConsentEvent::Revoked { .. } => "ConsentRevoked",
            ConsentEvent::Used { .. } => "ConsentUsed",
            ConsentEvent::Expired { .. } => "ConsentExpired",
        }
    }

    fn is_sensitive(&self) -> bool {
        // Authorization and usage payloads carry customer device details.
        matches!(
            self,
            ConsentEvent::Authorized { .. } | ConsentEvent::Used { .. }
        )
    }
}

/// Business-rule violations raised by consent commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsentError {
    /// The command input violates a domain invariant. No side effects.
    #[error("invalid consent request: {0}")]
    Validation(String),

    /// The requested transition is not allowed from the current status.
    #[error("cannot {action} consent in {status} state")]
    InvalidStateTransition {
        action: &'static str,
        status: ConsentStatus,
    },

    /// The consent was already revoked; revocation is one-way.
    #[error("consent is already revoked")]
    AlreadyRevoked,

    /// Usage can only be recorded against an authorized, unexpired consent.
    #[error("consent is not active (status {status})")]
    ConsentNotActive { status: ConsentStatus },
}

/// Raised when a historical event cannot be applied to the state it meets
/// during replay, which implies a corrupted stream.
#[derive(Debug, thiserror::Error)]
#[error("event {event_type} cannot be applied to a consent in {status} state")]
pub struct ConsentApplyError {
    pub event_type: &'static str,
    pub status: ConsentStatus,
}

/// The Consent aggregate. All state is a pure function of the ordered event
/// history; mutation happens exclusively in [`Aggregate::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    id: ConsentId,
    customer_id: CustomerId,
    participant_id: ParticipantId,
    scopes: BTreeSet<ConsentScope>,
    purpose: ConsentPurpose,
    status: ConsentStatus,
    created_at: DateTime<Utc>,
    authorized_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    revocation_reason: Option<String>,
    expires_at: DateTime<Utc>,
    usage_count: u64,
}

impl Consent {
    /// Builds the creation event for a new consent. The validity window is
    /// clamped to [1, [`MAX_VALIDITY_DAYS`]] days, so `expires_at` always
    /// lands after `created_at`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::Validation`] when the scopes are empty.
    pub fn create(
        id: ConsentId,
        customer_id: CustomerId,
        participant_id: ParticipantId,
        scopes: BTreeSet<ConsentScope>,
        purpose: ConsentPurpose,
        now: DateTime<Utc>,
        validity_days: Option<i64>,
    ) -> Result<ConsentEvent, ConsentError> {
        if scopes.is_empty() {
            return Err(ConsentError::Validation(
                "consent scopes cannot be empty".to_owned(),
            ));
        }

        let days = validity_days
            .unwrap_or_else(|| purpose.recommended_validity_days())
            .clamp(1, MAX_VALIDITY_DAYS);
        let expires_at = now + Duration::days(days);

        Ok(ConsentEvent::Created {
            event_id: Uuid::new_v4(),
            consent_id: id,
            customer_id,
            participant_id,
            scopes,
            purpose,
            created_at: now,
            expires_at,
        })
    }

    /// Builds the authorization event. Valid only from Pending.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::InvalidStateTransition`] from any other
    /// status.
    pub fn authorize(
        &self,
        context: AuthorizationContext,
        now: DateTime<Utc>,
    ) -> Result<ConsentEvent, ConsentError> {
        if self.status != ConsentStatus::Pending {
            return Err(ConsentError::InvalidStateTransition {
                action: "authorize",
                status: self.status,
            });
        }

        Ok(ConsentEvent::Authorized {
            event_id: Uuid::new_v4(),
            consent_id: self.id,
            context,
            authorized_at: now,
        })
    }

    /// Builds the revocation event. Valid from Pending or Authorized;
    /// revocation is one-way.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::AlreadyRevoked`] when already revoked and
    /// [`ConsentError::InvalidStateTransition`] when expired.
    pub fn revoke(
        &self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<ConsentEvent, ConsentError> {
        match self.status {
            ConsentStatus::Revoked => Err(ConsentError::AlreadyRevoked),
            ConsentStatus::Expired => Err(ConsentError::InvalidStateTransition {
                action: "revoke",
                status: self.status,
            }),
            ConsentStatus::Pending | ConsentStatus::Authorized => Ok(ConsentEvent::Revoked {
                event_id: Uuid::new_v4(),
                consent_id: self.id,
                reason: reason.into(),
                revoked_at: now,
            }),
        }
    }

    /// Builds a usage event. Valid only while Authorized and unexpired;
    /// each recorded usage increments the counter by exactly 1.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::ConsentNotActive`] otherwise.
    pub fn record_usage(
        &self,
        context: UsageContext,
        now: DateTime<Utc>,
    ) -> Result<ConsentEvent, ConsentError> {
        if !self.is_active(now) {
            return Err(ConsentError::ConsentNotActive {
                status: self.status,
            });
        }

        Ok(ConsentEvent::Used {
            event_id: Uuid::new_v4(),
            consent_id: self.id,
            context,
            used_at: now,
        })
    }

    /// Builds the expiry event for a consent past its validity window.
    ///
    /// # Errors
    ///
    /// Fails with [`ConsentError::InvalidStateTransition`] for terminal
    /// states and with [`ConsentError::Validation`] when the consent has not
    /// actually expired yet.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<ConsentEvent, ConsentError> {
        if self.status.is_terminal() {
            return Err(ConsentError::InvalidStateTransition {
                action: "expire",
                status: self.status,
            });
        }

        if now < self.expires_at {
            return Err(ConsentError::Validation(format!(
                "consent {} does not expire until {}",
                self.id, self.expires_at
            )));
        }

        Ok(ConsentEvent::Expired {
            event_id: Uuid::new_v4(),
            consent_id: self.id,
            expired_at: now,
        })
    }

    #[must_use]
    pub fn id(&self) -> ConsentId {
        self.id
    }

    #[must_use]
    pub fn customer_id(&self) -> &CustomerId {
        &self.customer_id
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    #[must_use]
    pub fn scopes(&self) -> &BTreeSet<ConsentScope> {
        &self.scopes
    }

    #[must_use]
    pub fn purpose(&self) -> ConsentPurpose {
        self.purpose
    }

    #[must_use]
    pub fn status(&self) -> ConsentStatus {
        self.status
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn authorized_at(&self) -> Option<DateTime<Utc>> {
        self.authorized_at
    }

    #[must_use]
    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        self.revoked_at
    }

    #[must_use]
    pub fn revocation_reason(&self) -> Option<&str> {
        self.revocation_reason.as_deref()
    }

    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    #[must_use]
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    /// Whether the validity window has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the consent can be used for data access right now.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == ConsentStatus::Authorized && !self.is_expired(now)
    }
}

impl Aggregate for Consent {
    const AGGREGATE_TYPE: &'static str = "consent";
    const SNAPSHOT_VERSION: u32 = 1;

    type DomainEvent = ConsentEvent;
    type ApplyError = ConsentApplyError;

    fn stream_id(&self) -> Uuid {
        self.id.as_uuid()
    }

    fn apply_new(event: &Self::DomainEvent) -> Result<Self, Self::ApplyError> {
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
            } => Ok(Self {
                id: *consent_id,
                customer_id: customer_id.clone(),
                participant_id: participant_id.clone(),
                scopes: scopes.clone(),
                purpose: *purpose,
                status: ConsentStatus::Pending,
                created_at: *created_at,
                authorized_at: None,
                revoked_at: None,
                revocation_reason: None,
                expires_at: *expires_at,
                usage_count: 0,
            }),
            other => Err(ConsentApplyError {
                event_type: other.event_type(),
                status: ConsentStatus::Pending,
            }),
        }
    }

    fn apply(&mut self, event: &Self::DomainEvent) -> Result<(), Self::ApplyError> {
        match event {
            ConsentEvent::Authorized { authorized_at, .. }
                if self.status == ConsentStatus::Pending =>
            {
                self.status = ConsentStatus::Authorized;
                self.authorized_at = Some(*authorized_at);
                Ok(())
            }
            ConsentEvent::Revoked {
                reason, revoked_at, ..
            } if !self.status.is_terminal() => {
                self.status = ConsentStatus::Revoked;
                self.revoked_at = Some(*revoked_at);
                self.revocation_reason = Some(reason.clone());
                Ok(())
            }
            ConsentEvent::Used { .. } if self.status == ConsentStatus::Authorized => {
                self.usage_count += 1;
                Ok(())
            }
            ConsentEvent::Expired { .. } if !self.status.is_terminal() => {
                self.status = ConsentStatus::Expired;
                Ok(())
            }
            other => Err(ConsentApplyError {
                event_type: other.event_type(),
                status: self.status,
            }),
        }
    }
}
