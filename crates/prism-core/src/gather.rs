//! Gather pipeline — sequential execution of one fusion recipe.
//!
//! The pipeline walks an instruction list strictly in order. Automated
//! gather steps expand their prompt templates, call the model with the ray
//! replies in the conversation context, and fold the answer forward as
//! `{{PrevStepOutput}}`. User-input steps suspend the whole run in
//! `AwaitingUserInput` until `supply_user_input` resumes it — suspension is
//! open-ended, with no timeout.
//!
//! The status is the single source of truth for what the pipeline will
//! accept next; every transition happens under one lock, and the lock is
//! never held across a model call.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::catalog::{Instruction, UserInputKind};
use crate::error::PrismError;
use crate::events::{EventBus, RunEvent};
use crate::invoke::{ConversationContext, InvokeError, InvokeRequest, ModelInvoker};
use crate::template::{
    self, TemplateContext, PLACEHOLDER_INPUT_TEXT, PLACEHOLDER_NO_ANSWERS,
    PLACEHOLDER_PREV_STEP, PLACEHOLDER_RAY_COUNT, PLACEHOLDER_YES_ANSWERS,
};

/// Where the pipeline currently is. `step` is a zero-based index into the
/// instruction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PipelineStatus {
    Idle,
    #[serde(rename_all = "camelCase")]
    Running { step: usize },
    #[serde(rename_all = "camelCase")]
    AwaitingUserInput { step: usize, kind: UserInputKind },
    Completed,
    #[serde(rename_all = "camelCase")]
    Failed { step: usize, reason: String },
    Aborted,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed { .. } | PipelineStatus::Aborted
        )
    }
}

/// The user's answer to a suspended step.
#[derive(Debug, Clone)]
pub enum UserReply {
    /// Selected and unselected checklist items.
    Checklist { yes: Vec<String>, no: Vec<String> },
    /// Free-form text.
    Text(String),
}

impl UserReply {
    fn kind(&self) -> UserInputKind {
        match self {
            UserReply::Checklist { .. } => UserInputKind::Checklist,
            UserReply::Text(_) => UserInputKind::FreeText,
        }
    }
}

/// Materialized output of one completed step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub step: usize,
    pub label: String,
    pub text: String,
}

/// What a suspended pipeline is waiting for.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInput {
    pub step: usize,
    pub label: String,
    pub kind: UserInputKind,
    /// For checklists: items parsed from the previous step's output.
    pub options: Vec<String>,
}

struct PipelineState {
    instructions: Vec<Instruction>,
    ray_context: ConversationContext,
    context: TemplateContext,
    outputs: Vec<StepOutput>,
    status: PipelineStatus,
}

/// One run's fusion pipeline. Created in `Idle`; single-shot — a finished
/// pipeline never runs again.
pub struct GatherPipeline {
    invoker: Arc<dyn ModelInvoker>,
    events: EventBus,
    run_id: String,
    model: String,
    cancel: CancellationToken,
    state: Mutex<PipelineState>,
}

impl GatherPipeline {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        events: EventBus,
        run_id: impl Into<String>,
        model: impl Into<String>,
        instructions: Vec<Instruction>,
        base_context: ConversationContext,
    ) -> Self {
        Self {
            invoker,
            events,
            run_id: run_id.into(),
            model: model.into(),
            cancel: CancellationToken::new(),
            state: Mutex::new(PipelineState {
                instructions,
                ray_context: base_context,
                context: TemplateContext::new(),
                outputs: Vec::new(),
                status: PipelineStatus::Idle,
            }),
        }
    }

    /// Start executing from step 0 with the given ray replies as context.
    /// Fails with [`PrismError::PipelineNotIdle`] if the pipeline already
    /// started (or was aborted before starting).
    pub async fn begin(&self, ray_texts: Vec<String>) -> Result<(), PrismError> {
        {
            let mut state = self.state.lock().await;
            if state.status != PipelineStatus::Idle {
                return Err(PrismError::PipelineNotIdle);
            }
            state
                .context
                .set(PLACEHOLDER_RAY_COUNT, ray_texts.len().to_string());
            state.ray_context = std::mem::take(&mut state.ray_context).with_ray_texts(&ray_texts);
            state.status = PipelineStatus::Running { step: 0 };
        }
        tracing::info!(
            "[GatherPipeline] Starting fusion for run {} ({} rays)",
            self.run_id,
            ray_texts.len()
        );
        self.run_steps().await;
        Ok(())
    }

    /// Resume a suspended pipeline with the user's answer. Rejected unless
    /// the status is `AwaitingUserInput` with a matching kind.
    pub async fn supply_user_input(&self, reply: UserReply) -> Result<(), PrismError> {
        {
            let mut state = self.state.lock().await;
            let (step, kind) = match state.status {
                PipelineStatus::AwaitingUserInput { step, kind } => (step, kind),
                _ => return Err(PrismError::NotAwaitingInput),
            };
            if reply.kind() != kind {
                return Err(PrismError::InputKindMismatch);
            }

            match &reply {
                UserReply::Checklist { yes, no } => {
                    state.context.set(PLACEHOLDER_YES_ANSWERS, yes.join("\n"));
                    state.context.set(PLACEHOLDER_NO_ANSWERS, no.join("\n"));
                }
                UserReply::Text(text) => {
                    state.context.set(PLACEHOLDER_INPUT_TEXT, text.clone());
                }
            }

            let (label, output_prompt) = match &state.instructions[step] {
                Instruction::Checklist { label, output_prompt }
                | Instruction::FreeText { label, output_prompt } => {
                    (label.clone(), output_prompt.clone())
                }
                // Unreachable: only input steps suspend.
                Instruction::Gather { .. } => return Err(PrismError::NotAwaitingInput),
            };

            let text = match template::expand(&output_prompt, &state.context) {
                Ok(text) => text,
                Err(e) => {
                    self.fail(&mut state, step, e.to_string());
                    return Ok(());
                }
            };

            self.commit_step(&mut state, step, label, text);
        }
        self.run_steps().await;
        Ok(())
    }

    /// Move the run to `Aborted` from any non-terminal state. Idempotent on
    /// terminal states. A step in flight observes the cancel token and its
    /// result is discarded.
    pub async fn abort(&self) {
        let mut state = self.state.lock().await;
        if state.status.is_terminal() {
            return;
        }
        tracing::info!("[GatherPipeline] Aborting run {}", self.run_id);
        state.status = PipelineStatus::Aborted;
        self.cancel.cancel();
        self.events.emit(RunEvent::RunAborted {
            run_id: self.run_id.clone(),
        });
    }

    pub async fn status(&self) -> PipelineStatus {
        self.state.lock().await.status.clone()
    }

    /// Outputs of every completed step so far, in order.
    pub async fn outputs(&self) -> Vec<StepOutput> {
        self.state.lock().await.outputs.clone()
    }

    /// The last step's output, once the run completed.
    pub async fn final_output(&self) -> Option<String> {
        let state = self.state.lock().await;
        if state.status != PipelineStatus::Completed {
            return None;
        }
        state.outputs.last().map(|o| o.text.clone())
    }

    /// Details of the awaited input while suspended.
    pub async fn pending_input(&self) -> Option<PendingInput> {
        let state = self.state.lock().await;
        let (step, kind) = match state.status {
            PipelineStatus::AwaitingUserInput { step, kind } => (step, kind),
            _ => return None,
        };
        let options = match kind {
            UserInputKind::Checklist => state
                .context
                .get(PLACEHOLDER_PREV_STEP)
                .map(parse_checklist_options)
                .unwrap_or_default(),
            UserInputKind::FreeText => Vec::new(),
        };
        Some(PendingInput {
            step,
            label: state.instructions[step].label().to_string(),
            kind,
            options,
        })
    }

    /// Drive automated steps until the pipeline suspends or terminates.
    async fn run_steps(&self) {
        loop {
            // Snapshot what the step needs, then release the lock before
            // any model call.
            let (step, instruction, context, ray_context) = {
                let mut state = self.state.lock().await;
                let step = match state.status {
                    PipelineStatus::Running { step } => step,
                    _ => return,
                };
                if step >= state.instructions.len() {
                    state.status = PipelineStatus::Completed;
                    tracing::info!("[GatherPipeline] Run {} completed", self.run_id);
                    self.events.emit(RunEvent::RunCompleted {
                        run_id: self.run_id.clone(),
                    });
                    return;
                }
                (
                    step,
                    state.instructions[step].clone(),
                    state.context.clone(),
                    state.ray_context.clone(),
                )
            };

            match instruction {
                Instruction::Gather {
                    label,
                    method,
                    system_prompt,
                    user_prompt,
                    ..
                } => {
                    if !self
                        .run_gather_step(step, label, method, system_prompt, user_prompt, context, ray_context)
                        .await
                    {
                        return;
                    }
                }
                Instruction::Checklist { .. } | Instruction::FreeText { .. } => {
                    let mut state = self.state.lock().await;
                    if state.status != (PipelineStatus::Running { step }) {
                        return;
                    }
                    let kind = state.instructions[step]
                        .user_input_kind()
                        .unwrap_or(UserInputKind::FreeText);
                    state.status = PipelineStatus::AwaitingUserInput { step, kind };
                    tracing::info!(
                        "[GatherPipeline] Run {} awaiting {:?} input at step {}",
                        self.run_id,
                        kind,
                        step
                    );
                    self.events.emit(RunEvent::AwaitingUserInput {
                        run_id: self.run_id.clone(),
                        step,
                        kind,
                        label: state.instructions[step].label().to_string(),
                    });
                    return;
                }
            }
        }
    }

    /// Execute one automated step. Returns false when the loop must stop
    /// (failure, abort, or a concurrent transition).
    #[allow(clippy::too_many_arguments)]
    async fn run_gather_step(
        &self,
        step: usize,
        label: String,
        method: String,
        system_prompt: String,
        user_prompt: String,
        context: TemplateContext,
        ray_context: ConversationContext,
    ) -> bool {
        let system_prompt = match template::expand(&system_prompt, &context) {
            Ok(p) => p,
            Err(e) => {
                let mut state = self.state.lock().await;
                self.fail(&mut state, step, e.to_string());
                return false;
            }
        };
        let user_prompt = match template::expand(&user_prompt, &context) {
            Ok(p) => p,
            Err(e) => {
                let mut state = self.state.lock().await;
                self.fail(&mut state, step, e.to_string());
                return false;
            }
        };

        self.events.emit(RunEvent::StepStarted {
            run_id: self.run_id.clone(),
            step,
            label: label.clone(),
        });

        let request = InvokeRequest {
            model: self.model.clone(),
            system_prompt,
            user_prompt,
            method,
            context: ray_context,
        };
        // Gather steps do not forward deltas; only the final text matters.
        let (chunk_tx, _chunk_rx) = mpsc::unbounded_channel();
        let result = self
            .invoker
            .invoke(request, chunk_tx, self.cancel.clone())
            .await;

        let mut state = self.state.lock().await;
        // An abort may have landed while the call was in flight; its result
        // is discarded.
        if state.status != (PipelineStatus::Running { step }) {
            return false;
        }
        match result {
            Ok(text) => {
                self.commit_step(&mut state, step, label, text);
                true
            }
            Err(InvokeError::Cancelled) => {
                state.status = PipelineStatus::Aborted;
                self.events.emit(RunEvent::RunAborted {
                    run_id: self.run_id.clone(),
                });
                false
            }
            Err(e) => {
                let reason = PrismError::StepFailed { step, source: e }.to_string();
                self.fail(&mut state, step, reason);
                false
            }
        }
    }

    /// Record a step's output, fold it forward, and advance.
    fn commit_step(&self, state: &mut PipelineState, step: usize, label: String, text: String) {
        state.context.set(PLACEHOLDER_PREV_STEP, text.clone());
        state.outputs.push(StepOutput { step, label, text });
        state.status = PipelineStatus::Running { step: step + 1 };
        self.events.emit(RunEvent::StepCompleted {
            run_id: self.run_id.clone(),
            step,
        });
    }

    fn fail(&self, state: &mut PipelineState, step: usize, reason: String) {
        tracing::warn!(
            "[GatherPipeline] Run {} failed at step {}: {}",
            self.run_id,
            step,
            reason
        );
        state.status = PipelineStatus::Failed {
            step,
            reason: reason.clone(),
        };
        self.events.emit(RunEvent::RunFailed {
            run_id: self.run_id.clone(),
            reason,
        });
    }
}

/// Extract checklist items from markdown `- [ ] ...` lines.
pub fn parse_checklist_options(text: &str) -> Vec<String> {
    let re = regex::Regex::new(r"(?m)^\s*-\s*\[[ xX]?\]\s*(.+?)\s*$").unwrap();
    re.captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}
