//! Core types and error definitions for the Cadence orchestrator.
//!
//! This crate holds the pieces shared by every other Cadence crate: the error
//! taxonomy and the data contracts exchanged with the outside world (worker
//! completion signals and human escalation resolutions).
//!
//! # Main types
//!
//! - [`CadenceError`]: Unified error enum for all Cadence subsystems.
//! - [`CadenceResult`]: Convenience alias for `Result<T, CadenceError>`.
//! - [`WorkerRole`]: The fixed set of external worker roles.
//! - [`AgentStatus`]: Status a worker role reports about itself.
//! - [`CompletionSignal`]: A validated inbound worker signal.
//! - [`ResolutionRequest`]: A human decision on a pending escalation.

/// Error taxonomy.
pub mod error;
/// Human escalation resolution contract.
pub mod resolution;
/// Worker roles and the inbound status signal contract.
pub mod signal;

pub use error::{CadenceError, CadenceResult};
pub use resolution::{ResolutionDecision, ResolutionRequest};
pub use signal::{AgentStatus, CompletionSignal, SignalEnvelope, ValidationPayload, WorkerRole};
