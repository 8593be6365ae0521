//! Ray pool — the concurrent scatter phase.
//!
//! `start` spawns exactly `count` independent generation tasks ("rays"),
//! each bound to the model assigned to its index. Rays run with no ordering
//! guarantee between them; one ray's failure never aborts its siblings.
//! Cancellation is cooperative: `cancel` fires a token that every in-flight
//! ray observes, and rays that cannot finish transition to `Aborted`.
//!
//! The pool's status table is the only structure mutated by multiple
//! concurrent writers; all writes go through one `RwLock` so `status()`
//! reads are consistent snapshots.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::PrismError;
use crate::events::{EventBus, RunEvent};
use crate::invoke::{ConversationContext, InvokeError, InvokeRequest, ModelInvoker};

/// Context-selection tag for scatter rays: the ray re-answers the user
/// message with plain conversation context (no alternatives yet).
const RAY_METHOD: &str = "s-s0-h0-u";

/// Lifecycle of one ray.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RayState {
    Pending,
    Streaming,
    Done,
    Errored,
    Aborted,
}

impl RayState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RayState::Done | RayState::Errored | RayState::Aborted)
    }
}

/// Consistent point-in-time view of one ray. Text grows monotonically
/// across successive snapshots of the same run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaySnapshot {
    pub index: usize,
    pub model: String,
    pub state: RayState,
    pub text: String,
    pub error: Option<String>,
}

/// Which model each ray index is bound to.
#[derive(Debug, Clone)]
pub enum ModelAssignment {
    /// Every ray uses the same model.
    Uniform(String),
    /// Ray `i` uses `models[i % models.len()]` (repeats round-robin when
    /// there are fewer models than rays).
    PerRay(Vec<String>),
}

impl ModelAssignment {
    fn validate(&self) -> Result<(), PrismError> {
        match self {
            ModelAssignment::Uniform(model) if model.is_empty() => Err(
                PrismError::InvalidAssignment("uniform model id is empty".to_string()),
            ),
            ModelAssignment::PerRay(models) if models.is_empty() => Err(
                PrismError::InvalidAssignment("per-ray model list is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Model id for ray `index`, with `${ENV_VAR}` references resolved.
    fn model_for(&self, index: usize) -> String {
        let model = match self {
            ModelAssignment::Uniform(model) => model,
            ModelAssignment::PerRay(models) => &models[index % models.len()],
        };
        crate::invoke::resolve_env_vars(model)
    }
}

/// The prompts every ray answers (model differs per ray).
#[derive(Debug, Clone)]
pub struct ScatterSpec {
    pub system_prompt: String,
    pub user_prompt: String,
    pub context: ConversationContext,
}

#[derive(Debug, Clone)]
struct Ray {
    index: usize,
    model: String,
    state: RayState,
    text: String,
    error: Option<String>,
}

impl Ray {
    fn snapshot(&self) -> RaySnapshot {
        RaySnapshot {
            index: self.index,
            model: self.model.clone(),
            state: self.state,
            text: self.text.clone(),
            error: self.error.clone(),
        }
    }
}

struct ActiveScatter {
    run_id: String,
    rays: Vec<Ray>,
    cancel: CancellationToken,
    done_rx: watch::Receiver<bool>,
}

/// Manages one scatter run at a time. Rays from a finished run stay
/// readable until the next `start` replaces them.
pub struct RayPool {
    invoker: Arc<dyn ModelInvoker>,
    events: EventBus,
    inner: Arc<RwLock<Option<ActiveScatter>>>,
}

impl RayPool {
    pub fn new(invoker: Arc<dyn ModelInvoker>, events: EventBus) -> Self {
        Self {
            invoker,
            events,
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Spawn `count` rays. Fails with [`PrismError::AlreadyRunning`] while
    /// any ray of a previous run is still non-terminal.
    pub async fn start(
        &self,
        run_id: &str,
        count: usize,
        assignment: &ModelAssignment,
        spec: ScatterSpec,
    ) -> Result<(), PrismError> {
        assignment.validate()?;
        // A zero-ray scatter has nothing to do; treat it as one ray so the
        // run always produces a candidate.
        let count = count.max(1);

        let mut inner = self.inner.write().await;
        if let Some(run) = inner.as_ref() {
            if run.rays.iter().any(|r| !r.state.is_terminal()) {
                return Err(PrismError::AlreadyRunning);
            }
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);

        let rays: Vec<Ray> = (0..count)
            .map(|index| Ray {
                index,
                model: assignment.model_for(index),
                state: RayState::Pending,
                text: String::new(),
                error: None,
            })
            .collect();

        tracing::info!("[RayPool] Scattering {} rays (run {})", count, run_id);

        *inner = Some(ActiveScatter {
            run_id: run_id.to_string(),
            rays: rays.clone(),
            cancel: cancel.clone(),
            done_rx,
        });
        drop(inner);

        for ray in rays {
            self.spawn_ray(run_id.to_string(), ray, spec.clone(), cancel.clone(), done_tx.clone());
        }
        Ok(())
    }

    fn spawn_ray(
        &self,
        run_id: String,
        ray: Ray,
        spec: ScatterSpec,
        cancel: CancellationToken,
        done_tx: Arc<watch::Sender<bool>>,
    ) {
        let invoker = Arc::clone(&self.invoker);
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let index = ray.index;

        tokio::spawn(async move {
            let request = InvokeRequest {
                model: ray.model.clone(),
                system_prompt: spec.system_prompt,
                user_prompt: spec.user_prompt,
                method: RAY_METHOD.to_string(),
                context: spec.context,
            };

            let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
            let invoke_fut = invoker.invoke(request, chunk_tx, cancel.clone());
            tokio::pin!(invoke_fut);

            let mut chunks_open = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        ray_terminal(&inner, &events, &run_id, index, RayState::Aborted, None, None).await;
                        break;
                    }
                    maybe_delta = chunk_rx.recv(), if chunks_open => match maybe_delta {
                        Some(delta) => ray_append(&inner, &events, &run_id, index, &delta).await,
                        None => chunks_open = false,
                    },
                    result = &mut invoke_fut => {
                        match result {
                            Ok(text) => {
                                ray_terminal(&inner, &events, &run_id, index, RayState::Done, Some(text), None).await;
                            }
                            Err(InvokeError::Cancelled) => {
                                ray_terminal(&inner, &events, &run_id, index, RayState::Aborted, None, None).await;
                            }
                            Err(e) => {
                                tracing::warn!("[RayPool] Ray {} errored: {}", index, e);
                                ray_terminal(&inner, &events, &run_id, index, RayState::Errored, None, Some(e.to_string())).await;
                            }
                        }
                        break;
                    }
                }
            }

            maybe_finish(&inner, &events, &run_id, &done_tx).await;
        });
    }

    /// Request cooperative termination of every not-yet-done ray of the
    /// named run. Already-done rays are left untouched; a stale run id is
    /// a no-op.
    pub async fn cancel(&self, run_id: &str) {
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(run) if run.run_id == run_id => {
                tracing::info!("[RayPool] Cancelling scatter run {}", run.run_id);
                run.cancel.cancel();
            }
            _ => {
                tracing::warn!("[RayPool] Ignoring cancel for unknown run {}", run_id);
            }
        }
    }

    /// Consistent snapshot of every ray of the named run. Empty for a
    /// stale run id.
    pub async fn status(&self, run_id: &str) -> Vec<RaySnapshot> {
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(run) if run.run_id == run_id => {
                run.rays.iter().map(Ray::snapshot).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Resolve once every ray of the named run has reached a terminal
    /// state, then return the final snapshots.
    pub async fn wait(&self, run_id: &str) -> Vec<RaySnapshot> {
        let rx = {
            let inner = self.inner.read().await;
            match inner.as_ref() {
                Some(run) if run.run_id == run_id => run.done_rx.clone(),
                _ => return Vec::new(),
            }
        };
        let mut rx = rx;
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.status(run_id).await
    }
}

/// Append streamed text to a ray and move it to `Streaming`.
async fn ray_append(
    inner: &Arc<RwLock<Option<ActiveScatter>>>,
    events: &EventBus,
    run_id: &str,
    index: usize,
    delta: &str,
) {
    let mut guard = inner.write().await;
    let Some(run) = guard.as_mut() else { return };
    if run.run_id != run_id {
        return;
    }
    let Some(ray) = run.rays.get_mut(index) else { return };
    if ray.state.is_terminal() {
        return;
    }
    ray.text.push_str(delta);
    ray.state = RayState::Streaming;
    events.emit(RunEvent::RayUpdated {
        run_id: run_id.to_string(),
        ray_index: index,
        state: ray.state,
        text_len: ray.text.len(),
    });
}

/// Commit a ray's terminal state. `Done` replaces the accumulated text with
/// the complete response (a superset of everything streamed so far).
async fn ray_terminal(
    inner: &Arc<RwLock<Option<ActiveScatter>>>,
    events: &EventBus,
    run_id: &str,
    index: usize,
    state: RayState,
    text: Option<String>,
    error: Option<String>,
) {
    let mut guard = inner.write().await;
    let Some(run) = guard.as_mut() else { return };
    if run.run_id != run_id {
        return;
    }
    let Some(ray) = run.rays.get_mut(index) else { return };
    if ray.state.is_terminal() {
        return;
    }
    ray.state = state;
    if let Some(text) = text {
        ray.text = text;
    }
    ray.error = error;
    events.emit(RunEvent::RayUpdated {
        run_id: run_id.to_string(),
        ray_index: index,
        state: ray.state,
        text_len: ray.text.len(),
    });
}

/// If every ray is terminal, flip the done watch and emit the summary.
async fn maybe_finish(
    inner: &Arc<RwLock<Option<ActiveScatter>>>,
    events: &EventBus,
    run_id: &str,
    done_tx: &watch::Sender<bool>,
) {
    let guard = inner.read().await;
    let Some(run) = guard.as_ref() else { return };
    if run.run_id != run_id {
        return;
    }
    if run.rays.iter().all(|r| r.state.is_terminal()) {
        let done = run.rays.iter().filter(|r| r.state == RayState::Done).count();
        let errored = run.rays.iter().filter(|r| r.state == RayState::Errored).count();
        let aborted = run.rays.iter().filter(|r| r.state == RayState::Aborted).count();
        tracing::info!(
            "[RayPool] Scatter complete (run {}): {} done, {} errored, {} aborted",
            run_id,
            done,
            errored,
            aborted
        );
        events.emit(RunEvent::ScatterCompleted {
            run_id: run_id.to_string(),
            done,
            errored,
            aborted,
        });
        let _ = done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::invoke::ChunkSink;

    /// Test collaborator keyed by model id: "fail:*" errors, "hang" waits
    /// for cancellation, "stream" sends two deltas, anything else replies
    /// immediately.
    struct ScriptedInvoker;

    #[async_trait]
    impl ModelInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            request: InvokeRequest,
            chunks: ChunkSink,
            cancel: CancellationToken,
        ) -> Result<String, InvokeError> {
            match request.model.as_str() {
                "hang" => {
                    cancel.cancelled().await;
                    Err(InvokeError::Cancelled)
                }
                "stream" => {
                    let _ = chunks.send("par".to_string());
                    let _ = chunks.send("tial".to_string());
                    tokio::task::yield_now().await;
                    Ok("partial and complete".to_string())
                }
                m if m.starts_with("fail") => Err(InvokeError::Http("boom".to_string())),
                m => Ok(format!("reply from {}", m)),
            }
        }
    }

    fn pool() -> RayPool {
        RayPool::new(Arc::new(ScriptedInvoker), EventBus::new())
    }

    fn spec() -> ScatterSpec {
        ScatterSpec {
            system_prompt: "sys".into(),
            user_prompt: "user".into(),
            context: ConversationContext::new(),
        }
    }

    #[tokio::test]
    async fn test_start_produces_count_terminal_rays() {
        let pool = pool();
        pool.start("r1", 4, &ModelAssignment::Uniform("m".into()), spec())
            .await
            .unwrap();
        let rays = pool.wait("r1").await;
        assert_eq!(rays.len(), 4);
        for ray in &rays {
            assert_eq!(ray.state, RayState::Done);
            assert_eq!(ray.text, "reply from m");
        }
    }

    #[tokio::test]
    async fn test_ray_errors_are_isolated() {
        let pool = pool();
        let assignment =
            ModelAssignment::PerRay(vec!["a".into(), "fail-b".into(), "c".into()]);
        pool.start("r1", 3, &assignment, spec()).await.unwrap();
        let rays = pool.wait("r1").await;
        assert_eq!(rays[0].state, RayState::Done);
        assert_eq!(rays[1].state, RayState::Errored);
        assert!(rays[1].error.as_deref().unwrap_or("").contains("boom"));
        assert_eq!(rays[2].state, RayState::Done);
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_ray_non_terminal() {
        let pool = pool();
        let assignment = ModelAssignment::PerRay(vec!["hang".into(), "hang".into()]);
        pool.start("r1", 2, &assignment, spec()).await.unwrap();
        pool.cancel("r1").await;
        let rays = pool.wait("r1").await;
        for ray in &rays {
            assert_eq!(ray.state, RayState::Aborted);
        }
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected() {
        let pool = pool();
        pool.start("r1", 1, &ModelAssignment::Uniform("hang".into()), spec())
            .await
            .unwrap();
        let err = pool
            .start("r2", 1, &ModelAssignment::Uniform("m".into()), spec())
            .await
            .unwrap_err();
        assert!(matches!(err, PrismError::AlreadyRunning));

        // After cancelling, a new run is accepted.
        pool.cancel("r1").await;
        pool.wait("r1").await;
        pool.start("r3", 1, &ModelAssignment::Uniform("m".into()), spec())
            .await
            .unwrap();
        let rays = pool.wait("r3").await;
        assert_eq!(rays[0].state, RayState::Done);
    }

    #[tokio::test]
    async fn test_streaming_text_is_monotone_then_complete() {
        let pool = pool();
        pool.start("r1", 1, &ModelAssignment::Uniform("stream".into()), spec())
            .await
            .unwrap();
        let rays = pool.wait("r1").await;
        assert_eq!(rays[0].state, RayState::Done);
        assert_eq!(rays[0].text, "partial and complete");
    }

    #[tokio::test]
    async fn test_empty_per_ray_assignment_rejected() {
        let pool = pool();
        let err = pool
            .start("r1", 2, &ModelAssignment::PerRay(vec![]), spec())
            .await
            .unwrap_err();
        assert!(matches!(err, PrismError::InvalidAssignment(_)));
    }

    #[tokio::test]
    async fn test_stale_run_id_is_ignored() {
        let pool = pool();
        pool.start("r1", 1, &ModelAssignment::Uniform("hang".into()), spec())
            .await
            .unwrap();

        // A stale id neither cancels nor observes the active run.
        pool.cancel("r0").await;
        assert!(pool.status("r0").await.is_empty());
        assert!(pool.wait("r0").await.is_empty());
        assert_eq!(pool.status("r1").await[0].state, RayState::Pending);

        pool.cancel("r1").await;
        let rays = pool.wait("r1").await;
        assert_eq!(rays[0].state, RayState::Aborted);
    }

    #[tokio::test]
    async fn test_assignment_resolves_env_references() {
        let pool = pool();
        let assignment =
            ModelAssignment::Uniform("${PRISM_TEST_RAY_MODEL:-m}".to_string());
        pool.start("r1", 1, &assignment, spec()).await.unwrap();
        let rays = pool.wait("r1").await;
        assert_eq!(rays[0].model, "m");
        assert_eq!(rays[0].text, "reply from m");
    }

    #[tokio::test]
    async fn test_assignment_cycles_when_short() {
        let pool = pool();
        let assignment = ModelAssignment::PerRay(vec!["a".into(), "b".into()]);
        pool.start("r1", 3, &assignment, spec()).await.unwrap();
        let rays = pool.wait("r1").await;
        assert_eq!(rays[0].model, "a");
        assert_eq!(rays[1].model, "b");
        assert_eq!(rays[2].model, "a");
    }
}
