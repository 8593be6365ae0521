//! Prism Core — scatter/gather fusion engine for parallel model replies.
//!
//! One user request is answered several times in parallel ("rays", the
//! scatter phase), then the candidates are merged by a sequential, resumable
//! instruction pipeline ("fusion", the gather phase) that may pause for
//! human input between steps.
//!
//! The crate is transport-agnostic: it has **no UI or HTTP server
//! dependency** and is consumed by:
//!
//! - CLI tools (via `prism-cli`)
//! - desktop/web front-ends (direct embedding)
//!
//! Layering, leaf-first:
//!
//! - [`template`] — `{{Name}}` placeholder expansion
//! - [`invoke`] — the model-invocation collaborator boundary
//! - [`catalog`] — fusion factories and their instruction lists
//! - [`scatter`] — the concurrent ray pool
//! - [`gather`] — the step-by-step instruction pipeline
//! - [`beam`] — the orchestration facade front-ends talk to

pub mod beam;
pub mod catalog;
pub mod error;
pub mod events;
pub mod gather;
pub mod invoke;
pub mod scatter;
pub mod template;

// Convenience re-exports
pub use beam::{BeamConfig, BeamOrchestrator, BeamRequest, RayPolicy, RunHandle, RunStatus};
pub use error::PrismError;
pub use gather::{PipelineStatus, UserReply};
pub use scatter::{ModelAssignment, RaySnapshot, RayState};
