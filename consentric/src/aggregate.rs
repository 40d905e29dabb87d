//! Module containing support for the Aggregate pattern.
//!
//! ## What is an Aggregate?
//!
//! An [Aggregate] is the most important concept in your domain.
//!
//! It represents the entities your business domain is composed of,
//! and the business logic your domain is exposing.
//!
//! In this crate the two Aggregates are a customer's data-sharing
//! [`Consent`](crate::consent::Consent) and the
//! [`Participant`](crate::participant::Participant) it is shared with.
//!
//! Aggregates expose mutations with the concept of **commands**: a Consent
//! exposes commands such as _"Authorize"_, _"Revoke"_ or _"Record Usage"_.
//!
//! In Event Sourcing, the Aggregate state is modified by the usage of
//! **Domain Events**, which carry some or all the fields in the state
//! in a certain logical meaning. Commands **produce** Domain Events, and
//! Aggregates provide a way to **fold** Domain Events on the current value
//! of the state, to produce the next state.

use std::fmt::Debug;

use uuid::Uuid;

use crate::event::DomainEvent;

mod root;

pub use root::*;

/// An Aggregate represents a Domain Model that, through an Aggregate [Root],
/// acts as a _transactional boundary_.
///
/// Aggregates are also used to enforce Domain invariants
/// (i.e. certain constraints or rules that are unique to a specific Domain).
///
/// Since this is an Event-sourced version of the Aggregate pattern,
/// any change to the Aggregate state must be represented through
/// a Domain Event, which is then applied to the current state
/// using the [`Aggregate::apply`] method.
///
/// Folding the full ordered event history through [`Aggregate::apply`] must
/// reproduce the exact current state, and must do so every time the history
/// is replayed.
pub trait Aggregate: Sized + Send + Sync + Clone {
    /// Stable name of the aggregate kind, persisted on every event record.
    const AGGREGATE_TYPE: &'static str;

    /// The current version of the snapshot to store.
    /// This number should be increased when a breaking change is made to
    /// the apply functions.
    const SNAPSHOT_VERSION: u32;

    /// The type of Domain Events that interest this Aggregate.
    /// Usually, this type should be an `enum`.
    type DomainEvent: DomainEvent;

    /// The error type that can be returned by [`Aggregate::apply`] when
    /// mutating the Aggregate state.
    type ApplyError: Send + Sync + Debug;

    /// Returns the identifier of the event stream this Aggregate instance
    /// is persisted under.
    fn stream_id(&self) -> Uuid;

    /// Create a new Aggregate through a Domain Event.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    fn apply_new(event: &Self::DomainEvent) -> Result<Self, Self::ApplyError>;

    /// Mutates the state of an Aggregate through a Domain Event.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    fn apply(&mut self, event: &Self::DomainEvent) -> Result<(), Self::ApplyError>;
}
