//! `docflow-core`: domain foundation for the analysis job lifecycle.
//!
//! This crate contains **pure domain** primitives (no IO, no runtime):
//! identifiers, the `Job` record and the state machine every store enforces.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::{FileRef, IdempotencyKey, JobId, WorkerId};
pub use job::{
    AnalysisResult, ErrorInfo, FailureKind, Job, JobPatch, JobState, JobSummary, Lease, LeaseGuard,
    NewJob,
};
