//! Beam orchestrator — the facade tying scatter and gather together.
//!
//! `start_run` scatters N rays, waits for the fan-in, applies the ray
//! policy, then hands the surviving replies to a fresh gather pipeline.
//! One run at a time: starting while another run is active is rejected, and
//! `stop` tears down both phases cooperatively.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::catalog::{FusionCatalog, UserInputKind, DEFAULT_FACTORY_ID};
use crate::error::PrismError;
use crate::events::{EventBus, RunEvent};
use crate::gather::{GatherPipeline, PendingInput, PipelineStatus, StepOutput, UserReply};
use crate::invoke::{ConversationContext, ModelInvoker};
use crate::scatter::{ModelAssignment, RayPool, RaySnapshot, RayState, ScatterSpec};

/// How many rays must complete successfully before fusion may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayPolicy {
    /// Every ray must reach `Done`.
    RequireAll,
    /// At least this many rays must reach `Done`.
    AtLeast(usize),
}

impl Default for RayPolicy {
    fn default() -> Self {
        RayPolicy::AtLeast(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BeamConfig {
    pub ray_policy: RayPolicy,
}

/// Everything one run needs.
#[derive(Debug, Clone)]
pub struct BeamRequest {
    pub ray_count: usize,
    pub assignment: ModelAssignment,
    /// Model used by the gather pipeline's automated steps.
    pub gather_model: String,
    pub factory_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Prior conversation carried into every ray and every gather step.
    pub context: ConversationContext,
}

impl BeamRequest {
    /// Minimal request: one uniform model for rays and gather alike.
    pub fn new(model: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            ray_count: 3,
            assignment: ModelAssignment::Uniform(model.clone()),
            gather_model: model,
            factory_id: DEFAULT_FACTORY_ID.to_string(),
            system_prompt: String::new(),
            user_prompt: user_prompt.into(),
            context: ConversationContext::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHandle {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

/// Derived view over both phases of the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RunStatus {
    /// Rays are still in flight.
    Scattering,
    #[serde(rename_all = "camelCase")]
    Fusing { step: usize },
    #[serde(rename_all = "camelCase")]
    AwaitingUserInput { step: usize, kind: UserInputKind },
    Completed,
    #[serde(rename_all = "camelCase")]
    Failed { reason: String },
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed { .. } | RunStatus::Aborted
        )
    }

    /// Terminal, or parked on user input — the states where nothing moves
    /// without an external call.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, RunStatus::AwaitingUserInput { .. })
    }
}

struct ActiveRun {
    handle: RunHandle,
    pool: Arc<RayPool>,
    pipeline: Arc<GatherPipeline>,
    /// Set when the fan-in policy was breached; the pipeline never started.
    fanin_failure: Arc<RwLock<Option<String>>>,
}

/// Facade over the ray pool, the catalog, and the gather pipeline.
pub struct BeamOrchestrator {
    catalog: FusionCatalog,
    invoker: Arc<dyn ModelInvoker>,
    config: BeamConfig,
    events: EventBus,
    inner: Arc<RwLock<Option<ActiveRun>>>,
}

impl BeamOrchestrator {
    pub fn new(invoker: Arc<dyn ModelInvoker>, config: BeamConfig) -> Self {
        Self {
            catalog: FusionCatalog::builtin(),
            invoker,
            config,
            events: EventBus::new(),
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub fn catalog(&self) -> &FusionCatalog {
        &self.catalog
    }

    /// Mutable catalog access for registering user-defined factories before
    /// starting runs.
    pub fn catalog_mut(&mut self) -> &mut FusionCatalog {
        &mut self.catalog
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Start a new scatter/gather run. Rejected while another run is still
    /// active; stop it first.
    pub async fn start_run(&self, request: BeamRequest) -> Result<RunHandle, PrismError> {
        let mut inner = self.inner.write().await;
        if let Some(run) = inner.as_ref() {
            if !self.run_is_over(run).await {
                return Err(PrismError::AlreadyRunning);
            }
        }

        // Resolve the factory before spawning anything.
        let instructions = self.catalog.instantiate(&request.factory_id)?;

        let run_id = Uuid::new_v4().to_string();
        let handle = RunHandle {
            run_id: run_id.clone(),
            created_at: Utc::now(),
        };
        tracing::info!(
            "[BeamOrchestrator] Starting run {} ({} rays, factory '{}')",
            run_id,
            request.ray_count,
            request.factory_id
        );

        let pool = Arc::new(RayPool::new(Arc::clone(&self.invoker), self.events.clone()));
        let pipeline = Arc::new(GatherPipeline::new(
            Arc::clone(&self.invoker),
            self.events.clone(),
            run_id.clone(),
            crate::invoke::resolve_env_vars(&request.gather_model),
            instructions,
            request.context.clone(),
        ));

        pool.start(
            &run_id,
            request.ray_count,
            &request.assignment,
            ScatterSpec {
                system_prompt: request.system_prompt.clone(),
                user_prompt: request.user_prompt.clone(),
                context: request.context,
            },
        )
        .await?;

        let fanin_failure = Arc::new(RwLock::new(None));
        *inner = Some(ActiveRun {
            handle: handle.clone(),
            pool: Arc::clone(&pool),
            pipeline: Arc::clone(&pipeline),
            fanin_failure: Arc::clone(&fanin_failure),
        });
        drop(inner);

        self.spawn_driver(run_id, pool, pipeline, fanin_failure);
        Ok(handle)
    }

    /// Bridge the fan-in: wait for all rays, apply the policy, start fusion.
    fn spawn_driver(
        &self,
        run_id: String,
        pool: Arc<RayPool>,
        pipeline: Arc<GatherPipeline>,
        fanin_failure: Arc<RwLock<Option<String>>>,
    ) {
        let policy = self.config.ray_policy;
        let events = self.events.clone();

        tokio::spawn(async move {
            let rays = pool.wait(&run_id).await;

            // A stop during scatter already moved the pipeline off Idle.
            if pipeline.status().await != PipelineStatus::Idle {
                return;
            }

            let texts: Vec<String> = rays
                .iter()
                .filter(|r| r.state == RayState::Done)
                .map(|r| r.text.clone())
                .collect();
            let required = match policy {
                RayPolicy::RequireAll => rays.len(),
                RayPolicy::AtLeast(n) => n.min(rays.len()).max(1),
            };

            if texts.len() < required {
                let mut reason = PrismError::RaysUnavailable {
                    required,
                    completed: texts.len(),
                }
                .to_string();
                let errors: Vec<String> = rays
                    .iter()
                    .filter_map(|r| {
                        r.error
                            .as_ref()
                            .map(|e| format!("ray {}: {}", r.index, e))
                    })
                    .collect();
                if !errors.is_empty() {
                    reason = format!("{} ({})", reason, errors.join("; "));
                }
                tracing::warn!("[BeamOrchestrator] Run {} failed fan-in: {}", run_id, reason);
                *fanin_failure.write().await = Some(reason.clone());
                events.emit(RunEvent::RunFailed { run_id, reason });
                return;
            }

            // PipelineNotIdle here means an abort won the race; nothing to do.
            let _ = pipeline.begin(texts).await;
        });
    }

    /// Abort the named run: cancel in-flight rays and the pipeline. A
    /// handle from an earlier run is a no-op.
    pub async fn stop(&self, handle: &RunHandle) {
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(run) if run.handle.run_id == handle.run_id => {
                tracing::info!("[BeamOrchestrator] Stopping run {}", run.handle.run_id);
                run.pool.cancel(&run.handle.run_id).await;
                run.pipeline.abort().await;
            }
            _ => {
                tracing::warn!(
                    "[BeamOrchestrator] Ignoring stop for unknown run {}",
                    handle.run_id
                );
            }
        }
    }

    /// Forward the user's answer to the suspended pipeline.
    pub async fn supply_user_input(&self, reply: UserReply) -> Result<(), PrismError> {
        let pipeline = {
            let inner = self.inner.read().await;
            match inner.as_ref() {
                Some(run) => Arc::clone(&run.pipeline),
                None => return Err(PrismError::NotAwaitingInput),
            }
        };
        pipeline.supply_user_input(reply).await
    }

    /// Derived status of the named run, or `None` if the handle does not
    /// refer to the active run.
    pub async fn status(&self, handle: &RunHandle) -> Option<RunStatus> {
        let inner = self.inner.read().await;
        let run = inner.as_ref().filter(|run| run.handle.run_id == handle.run_id)?;
        Some(self.derive_status(run).await)
    }

    /// Snapshots of the current run's rays.
    pub async fn rays(&self) -> Vec<RaySnapshot> {
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(run) => run.pool.status(&run.handle.run_id).await,
            None => Vec::new(),
        }
    }

    /// Block until every ray of the current run is terminal, then return
    /// the final snapshots.
    pub async fn wait_rays(&self) -> Vec<RaySnapshot> {
        let (pool, run_id) = {
            let inner = self.inner.read().await;
            match inner.as_ref() {
                Some(run) => (Arc::clone(&run.pool), run.handle.run_id.clone()),
                None => return Vec::new(),
            }
        };
        pool.wait(&run_id).await
    }

    pub async fn outputs(&self) -> Vec<StepOutput> {
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(run) => run.pipeline.outputs().await,
            None => Vec::new(),
        }
    }

    pub async fn pending_input(&self) -> Option<PendingInput> {
        let inner = self.inner.read().await;
        let run = inner.as_ref()?;
        run.pipeline.pending_input().await
    }

    /// The fused result, once the run completed.
    pub async fn final_output(&self) -> Option<String> {
        let inner = self.inner.read().await;
        let run = inner.as_ref()?;
        run.pipeline.final_output().await
    }

    /// Block until the current run is terminal or parked on user input.
    pub async fn wait_settled(&self) -> Option<RunStatus> {
        let mut rx = self.events.subscribe();
        loop {
            let status = self.current_status().await?;
            if status.is_settled() {
                return Some(status);
            }
            // Every settling transition emits an event after committing, so
            // recv cannot miss the wake-up; Lagged only means we re-check.
            match rx.recv().await {
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return self.current_status().await;
                }
            }
        }
    }

    async fn current_status(&self) -> Option<RunStatus> {
        let inner = self.inner.read().await;
        let run = inner.as_ref()?;
        Some(self.derive_status(run).await)
    }

    async fn derive_status(&self, run: &ActiveRun) -> RunStatus {
        if let Some(reason) = run.fanin_failure.read().await.clone() {
            return RunStatus::Failed { reason };
        }
        match run.pipeline.status().await {
            PipelineStatus::Idle => RunStatus::Scattering,
            PipelineStatus::Running { step } => RunStatus::Fusing { step },
            PipelineStatus::AwaitingUserInput { step, kind } => {
                RunStatus::AwaitingUserInput { step, kind }
            }
            PipelineStatus::Completed => RunStatus::Completed,
            PipelineStatus::Failed { reason, .. } => RunStatus::Failed { reason },
            PipelineStatus::Aborted => RunStatus::Aborted,
        }
    }

    async fn run_is_over(&self, run: &ActiveRun) -> bool {
        self.derive_status(run).await.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::catalog::{FusionFactory, Instruction};
    use crate::invoke::{ChunkSink, InvokeError, InvokeRequest};

    /// Scripted collaborator that records every request it receives.
    /// Ray models reply with their own name; model "fail" errors; model
    /// "hang" waits for cancellation; everything else echoes its expanded
    /// user prompt.
    struct RecordingInvoker {
        requests: Mutex<Vec<InvokeRequest>>,
    }

    impl RecordingInvoker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
            })
        }

        async fn requests_for(&self, model: &str) -> Vec<InvokeRequest> {
            self.requests
                .lock()
                .await
                .iter()
                .filter(|r| r.model == model)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl ModelInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            request: InvokeRequest,
            _chunks: ChunkSink,
            cancel: CancellationToken,
        ) -> Result<String, InvokeError> {
            self.requests.lock().await.push(request.clone());
            match request.model.as_str() {
                "hang" => {
                    cancel.cancelled().await;
                    Err(InvokeError::Cancelled)
                }
                "fail" => Err(InvokeError::Http("connection refused".to_string())),
                m if m.starts_with("ray-") => Ok(format!("reply from {}", m)),
                _ => Ok(format!("fused[{}]", request.user_prompt)),
            }
        }
    }

    fn single_step_factory(user_prompt: &str) -> FusionFactory {
        FusionFactory::from_instructions(
            "merge-test",
            "Merge Test",
            "test factory",
            vec![Instruction::Gather {
                label: "Merging".to_string(),
                method: "s-s0-h0-u0-aN-u".to_string(),
                system_prompt: "merge".to_string(),
                user_prompt: user_prompt.to_string(),
                display: None,
            }],
        )
    }

    fn request(factory_id: &str, models: Vec<&str>) -> BeamRequest {
        BeamRequest {
            ray_count: models.len(),
            assignment: ModelAssignment::PerRay(models.into_iter().map(String::from).collect()),
            gather_model: "gather".to_string(),
            factory_id: factory_id.to_string(),
            system_prompt: "be helpful".to_string(),
            user_prompt: "the question".to_string(),
            context: ConversationContext::new(),
        }
    }

    #[tokio::test]
    async fn test_full_run_scatter_then_fuse() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker.clone(), BeamConfig::default());
        orch.catalog_mut()
            .register(single_step_factory("Merge: {{N}} replies"))
            .unwrap();

        orch.start_run(request("merge-test", vec!["ray-a", "ray-b", "ray-c"]))
            .await
            .unwrap();
        let status = orch.wait_settled().await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(
            orch.final_output().await.as_deref(),
            Some("fused[Merge: 3 replies]")
        );

        // The gather call carried the ray replies as numbered context
        // messages, not as template substitutions.
        let gather_calls = invoker.requests_for("gather").await;
        assert_eq!(gather_calls.len(), 1);
        assert_eq!(gather_calls[0].user_prompt, "Merge: 3 replies");
        let ctx = &gather_calls[0].context.messages;
        assert_eq!(ctx.len(), 3);
        assert!(ctx[0].content.starts_with("Response 1:"));
        assert!(ctx[2].content.contains("reply from ray-c"));
    }

    #[tokio::test]
    async fn test_partial_failure_tolerated_by_default_policy() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker, BeamConfig::default());
        orch.catalog_mut()
            .register(single_step_factory("Merge: {{N}} replies"))
            .unwrap();

        orch.start_run(request("merge-test", vec!["ray-a", "fail", "ray-c"]))
            .await
            .unwrap();
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Completed);
        // Only the two successful replies reached the gather step.
        assert_eq!(
            orch.final_output().await.as_deref(),
            Some("fused[Merge: 2 replies]")
        );
    }

    #[tokio::test]
    async fn test_require_all_policy_fails_on_errored_ray() {
        let invoker = RecordingInvoker::new();
        let config = BeamConfig {
            ray_policy: RayPolicy::RequireAll,
        };
        let mut orch = BeamOrchestrator::new(invoker, config);
        orch.catalog_mut()
            .register(single_step_factory("x"))
            .unwrap();

        orch.start_run(request("merge-test", vec!["ray-a", "fail"]))
            .await
            .unwrap();
        match orch.wait_settled().await.unwrap() {
            RunStatus::Failed { reason } => {
                assert!(reason.contains("1 of 2"));
                assert!(reason.contains("connection refused"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(orch.final_output().await.is_none());
    }

    #[tokio::test]
    async fn test_all_rays_failing_fails_the_run() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker, BeamConfig::default());
        orch.catalog_mut()
            .register(single_step_factory("x"))
            .unwrap();

        orch.start_run(request("merge-test", vec!["fail", "fail"]))
            .await
            .unwrap();
        assert!(matches!(
            orch.wait_settled().await.unwrap(),
            RunStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_checklist_run_round_trip() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker.clone(), BeamConfig::default());
        orch.catalog_mut()
            .register(FusionFactory::from_instructions(
                "guided-test",
                "Guided Test",
                "test factory",
                vec![
                    Instruction::Gather {
                        label: "Listing".to_string(),
                        method: "s-s0-h0-u0-aN-u".to_string(),
                        system_prompt: "list".to_string(),
                        user_prompt: "options from {{N}}".to_string(),
                        display: None,
                    },
                    Instruction::Checklist {
                        label: "Pick".to_string(),
                        output_prompt: "selected:\n{{YesAnswers}}\nskipped:\n{{NoAnswers}}"
                            .to_string(),
                    },
                    Instruction::Gather {
                        label: "Merging".to_string(),
                        method: "s-s0-h0-u0-aN-u".to_string(),
                        system_prompt: "merge".to_string(),
                        user_prompt: "apply:\n{{PrevStepOutput}}".to_string(),
                        display: None,
                    },
                ],
            ))
            .unwrap();

        orch.start_run(request("guided-test", vec!["ray-a", "ray-b"]))
            .await
            .unwrap();
        assert_eq!(
            orch.wait_settled().await.unwrap(),
            RunStatus::AwaitingUserInput {
                step: 1,
                kind: UserInputKind::Checklist
            }
        );

        orch.supply_user_input(UserReply::Checklist {
            yes: vec!["item1".to_string()],
            no: vec!["item2".to_string()],
        })
        .await
        .unwrap();
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Completed);

        // The second gather call saw the user's split.
        let gather_calls = invoker.requests_for("gather").await;
        assert_eq!(gather_calls.len(), 2);
        assert!(gather_calls[1].user_prompt.contains("selected:\nitem1"));
        assert!(gather_calls[1].user_prompt.contains("skipped:\nitem2"));
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_active() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker, BeamConfig::default());
        orch.catalog_mut()
            .register(single_step_factory("x"))
            .unwrap();

        let handle = orch
            .start_run(request("merge-test", vec!["hang"]))
            .await
            .unwrap();
        let err = orch
            .start_run(request("merge-test", vec!["ray-a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PrismError::AlreadyRunning));

        // After stopping, a new run is accepted.
        orch.stop(&handle).await;
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Aborted);
        orch.start_run(request("merge-test", vec!["ray-a"]))
            .await
            .unwrap();
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_during_scatter_leaves_everything_terminal() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker.clone(), BeamConfig::default());
        orch.catalog_mut()
            .register(single_step_factory("x"))
            .unwrap();

        let handle = orch
            .start_run(request("merge-test", vec!["hang", "hang"]))
            .await
            .unwrap();
        orch.stop(&handle).await;
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Aborted);
        for ray in orch.wait_rays().await {
            assert!(ray.state.is_terminal());
        }
        // The pipeline never ran, so no gather call was made.
        assert!(invoker.requests_for("gather").await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_touch_a_newer_run() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker, BeamConfig::default());
        orch.catalog_mut()
            .register(single_step_factory("x"))
            .unwrap();

        let old = orch
            .start_run(request("merge-test", vec!["ray-a"]))
            .await
            .unwrap();
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Completed);
        assert_eq!(orch.status(&old).await, Some(RunStatus::Completed));

        let current = orch
            .start_run(request("merge-test", vec!["hang"]))
            .await
            .unwrap();
        // The old handle no longer resolves, and stopping through it
        // leaves the new run untouched.
        assert_eq!(orch.status(&old).await, None);
        orch.stop(&old).await;
        assert_eq!(orch.status(&current).await, Some(RunStatus::Scattering));

        orch.stop(&current).await;
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_gather_model_env_reference_is_resolved() {
        let invoker = RecordingInvoker::new();
        let mut orch = BeamOrchestrator::new(invoker.clone(), BeamConfig::default());
        orch.catalog_mut()
            .register(single_step_factory("x"))
            .unwrap();

        let mut req = request("merge-test", vec!["ray-a"]);
        req.gather_model = "${PRISM_TEST_GATHER_MODEL:-gather}".to_string();
        orch.start_run(req).await.unwrap();
        assert_eq!(orch.wait_settled().await.unwrap(), RunStatus::Completed);
        assert_eq!(invoker.requests_for("gather").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_factory_rejected_before_scatter() {
        let invoker = RecordingInvoker::new();
        let orch = BeamOrchestrator::new(invoker.clone(), BeamConfig::default());
        let err = orch
            .start_run(request("nope", vec!["ray-a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, PrismError::UnknownFactory(_)));
        assert!(invoker.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_supply_input_without_run() {
        let orch = BeamOrchestrator::new(RecordingInvoker::new(), BeamConfig::default());
        let err = orch
            .supply_user_input(UserReply::Text("hello".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PrismError::NotAwaitingInput));
    }
}
