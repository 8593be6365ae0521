//! Core error type for the prism engine.
//!
//! `PrismError` is used throughout the engine (catalog, scatter, gather,
//! facade). Ray-level invocation failures are *not* represented here: they
//! are absorbed into [`crate::scatter::RayState::Errored`] per ray and never
//! fail the pool. Cancellation is not an error either — aborted runs land in
//! a terminal `Aborted` status, not in a `Result::Err`.

use crate::invoke::InvokeError;
use crate::template::TemplateError;

#[derive(Debug, thiserror::Error)]
pub enum PrismError {
    /// A scatter run (or facade run) is still active; cancel it first.
    #[error("a run is already active; stop it before starting a new one")]
    AlreadyRunning,

    /// `supply_user_input` was called while the pipeline was not suspended.
    #[error("pipeline is not awaiting user input")]
    NotAwaitingInput,

    /// The supplied user input does not match the suspended step's kind.
    #[error("supplied user input does not match the awaited kind")]
    InputKindMismatch,

    /// `begin` was called on a pipeline that already ran.
    #[error("pipeline is not idle; create a new run to re-execute")]
    PipelineNotIdle,

    #[error("unknown fusion factory '{0}'")]
    UnknownFactory(String),

    #[error("invalid model assignment: {0}")]
    InvalidAssignment(String),

    #[error("duplicate fusion factory id '{0}'")]
    DuplicateFactory(String),

    /// A catalog-authoring defect surfaced during template expansion.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A gather step's model call failed. Fatal to the run: later steps
    /// depend on this step's output.
    #[error("gather step {step} failed: {source}")]
    StepFailed {
        step: usize,
        #[source]
        source: InvokeError,
    },

    /// Fan-in policy was not met after scatter.
    #[error("only {completed} of {required} rays completed successfully")]
    RaysUnavailable { required: usize, completed: usize },

    /// A user-authored factory file could not be parsed.
    #[error("factory file error: {0}")]
    FactoryFile(String),
}
