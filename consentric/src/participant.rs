//! The Participant aggregate: directory bookkeeping for the platforms data
//! is shared with.
//!
//! Validation and onboarding facts land on the participant's own event
//! stream so consent streams stay pure and the participant directory read
//! model can be rebuilt from history like everything else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::consent::ParticipantId;
use crate::event::DomainEvent;

/// Role a participant plays in the data-sharing ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    DataHolder,
    DataRecipient,
}

/// Outcome of a directory validation, as reported by the external
/// participant-directory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantValidation {
    pub valid: bool,
    pub reason: Option<String>,
    pub legal_name: Option<String>,
    pub role: Option<ParticipantRole>,
}

impl ParticipantValidation {
    #[must_use]
    pub fn valid(legal_name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            valid: true,
            reason: None,
            legal_name: Some(legal_name.into()),
            role: Some(role),
        }
    }

    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
            legal_name: None,
            role: None,
        }
    }
}

/// The closed set of events a participant stream can contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParticipantEvent {
    Onboarded {
        event_id: Uuid,
        participant_id: ParticipantId,
        legal_name: String,
        role: ParticipantRole,
        onboarded_at: DateTime<Utc>,
    },
    Validated {
        event_id: Uuid,
        participant_id: ParticipantId,
        valid: bool,
        details: Option<String>,
        validated_at: DateTime<Utc>,
    },
}

impl DomainEvent for ParticipantEvent {
    fn event_id(&self) -> Uuid {
        match self {
            ParticipantEvent::Onboarded { event_id, .. }
            | ParticipantEvent::Validated { event_id, .. } => *event_id,
        }
    }

    fn event_type(&self) -> &'static str {
        match self {
            ParticipantEvent::Onboarded { .. } => "ParticipantOnboarded",
            ParticipantEvent::Validated { .. } => "ParticipantValidated",
        }
    }
}

/// Raised when a historical participant event meets a state it cannot apply
/// to during replay.
#[derive(Debug, thiserror::Error)]
#[error("event {event_type} cannot be applied to the participant stream")]
pub struct ParticipantApplyError {
    pub event_type: &'static str,
}

/// Directory state for one participant, folded from its event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    participant_id: ParticipantId,
    legal_name: String,
    role: ParticipantRole,
    last_validation_valid: Option<bool>,
    onboarded_at: DateTime<Utc>,
    last_validated_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// Deterministic stream id for a directory-issued participant id.
    #[must_use]
    pub fn stream_id_for(id: &ParticipantId) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, id.as_str().as_bytes())
    }

    /// Builds the onboarding event for a participant seen for the first
    /// time.
    #[must_use]
    pub fn onboard(
        participant_id: ParticipantId,
        legal_name: impl Into<String>,
        role: ParticipantRole,
        now: DateTime<Utc>,
    ) -> ParticipantEvent {
        ParticipantEvent::Onboarded {
            event_id: Uuid::new_v4(),
            participant_id,
            legal_name: legal_name.into(),
            role,
            onboarded_at: now,
        }
    }

    /// Builds a validation event recording the directory's latest answer.
    #[must_use]
    pub fn record_validation(
        &self,
        valid: bool,
        details: Option<String>,
        now: DateTime<Utc>,
    ) -> ParticipantEvent {
        ParticipantEvent::Validated {
            event_id: Uuid::new_v4(),
            participant_id: self.participant_id.clone(),
            valid,
            details,
            validated_at: now,
        }
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    #[must_use]
    pub fn legal_name(&self) -> &str {
        &self.legal_name
    }

    #[must_use]
    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    #[must_use]
    pub fn last_validation_valid(&self) -> Option<bool> {
        self.last_validation_valid
    }

    #[must_use]
    pub fn onboarded_at(&self) -> DateTime<Utc> {
        self.onboarded_at
    }

    #[must_use]
    pub fn last_validated_at(&self) -> Option<DateTime<Utc>> {
        self.last_validated_at
    }
}

impl Aggregate for Participant {
    const AGGREGATE_TYPE: &'static str = "participant";
    const SNAPSHOT_VERSION: u32 = 1;

    type DomainEvent = ParticipantEvent;
    type ApplyError = ParticipantApplyError;

    fn stream_id(&self) -> Uuid {
        Self::stream_id_for(&self.participant_id)
    }

    fn apply_new(event: &Self::DomainEvent) -> Result<Self, Self::ApplyError> {
        match event {
            ParticipantEvent::Onboarded {
                participant_id,
                legal_name,
                role,
                onboarded_at,
                ..
            } => Ok(Self {
                participant_id: participant_id.clone(),
                legal_name: legal_name.clone(),
                role: *role,
                last_validation_valid: None,
                onboarded_at: *onboarded_at,
                last_validated_at: None,
            }),
            other => Err(ParticipantApplyError {
                event_type: other.event_type(),
            }),
        }
    }

    fn apply(&mut self, event: &Self::DomainEvent) -> Result<(), Self::ApplyError> {
        match event {
            ParticipantEvent::Validated {
                valid,
                validated_at,
                ..
            } => {
                self.last_validation_valid = Some(*valid);
                self.last_validated_at = Some(*validated_at);
                Ok(())
            }
            other => Err(ParticipantApplyError {
                event_type: other.event_type(),
            }),
        }
    }
}
