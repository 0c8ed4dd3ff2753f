//! Enrollment session reconciliation.
//!
//! This crate provides:
//! - The pure session state machine (`machine::transition`)
//! - `Reconciler` and the `Coordinator` task that serializes every mutation
//! - `QueryFacade` with a bounded cache of events-browser pages
//! - `EnrollmentEngine`, which wires the notification channel to both

pub mod cache;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod facade;
pub mod machine;

pub use cache::EventCache;
pub use coordinator::{
    CancelOutcome, Coordinator, CoordinatorHandle, Reconciler, SessionChange,
    OPERATOR_CANCEL_REASON,
};
pub use engine::{Collaborators, EnrollmentEngine};
pub use error::EngineError;
pub use facade::QueryFacade;
pub use machine::{transition, Input, TimeoutPolicy, Transition};
