//! Consentric manages the lifecycle of customer data-sharing consents as an
//! append-only event history: state is derived solely by replaying events,
//! writes are guarded by optimistic concurrency, and query models are kept
//! eventually consistent by asynchronous projections.

pub mod aggregate;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod consent;
pub mod event;
pub mod metrics;
pub mod participant;
pub mod projection;
pub mod repository;
pub mod saga;
pub mod store;
pub mod sweeper;

/// Version of an aggregate, equal to the number of events applied to it.
pub type Version = u32;
