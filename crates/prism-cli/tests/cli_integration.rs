//! Integration tests for the prism CLI flows.
//!
//! These exercise the same engine code paths the binary drives, with a
//! scripted model invoker instead of HTTP, and factory files written to
//! temporary directories for isolation.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use prism_core::beam::{BeamConfig, BeamOrchestrator, BeamRequest, RunStatus};
use prism_core::catalog::{FactoryFile, UserInputKind, DEFAULT_FACTORY_ID};
use prism_core::gather::UserReply;
use prism_core::invoke::{ChunkSink, InvokeError, InvokeRequest, ModelInvoker};
use prism_core::scatter::ModelAssignment;

/// Ray models reply with their own name; the gather model echoes its
/// expanded user prompt.
struct ScriptedInvoker;

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: InvokeRequest,
        _chunks: ChunkSink,
        _cancel: CancellationToken,
    ) -> Result<String, InvokeError> {
        if request.model == "gather" {
            Ok(format!("fused[{}]", request.user_prompt))
        } else {
            Ok(format!("candidate from {}", request.model))
        }
    }
}

fn test_request(factory_id: &str) -> BeamRequest {
    BeamRequest {
        ray_count: 3,
        assignment: ModelAssignment::Uniform("ray-model".to_string()),
        gather_model: "gather".to_string(),
        factory_id: factory_id.to_string(),
        system_prompt: String::new(),
        user_prompt: "the question".to_string(),
        context: Default::default(),
    }
}

#[tokio::test]
async fn test_default_factory_run_completes() {
    let orchestrator = BeamOrchestrator::new(Arc::new(ScriptedInvoker), BeamConfig::default());
    orchestrator
        .start_run(test_request(DEFAULT_FACTORY_ID))
        .await
        .expect("run should start");

    let status = orchestrator.wait_settled().await.expect("run exists");
    assert_eq!(status, RunStatus::Completed);

    // The built-in fuse prompt references {{N}}; with 3 successful rays
    // the expanded prompt must carry the literal count.
    let output = orchestrator.final_output().await.expect("output exists");
    assert!(output.starts_with("fused["));
    assert!(output.contains('3'));
}

#[tokio::test]
async fn test_factory_file_registration_and_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("style-merge.yaml");
    let mut file = std::fs::File::create(&path).expect("create factory file");
    write!(
        file,
        r#"factoryId: "style-merge"
shortLabel: "Style Merge"
description: "Merge replies following a user-described style."
instructions:
  - type: user-input-text
    label: "Describe the style"
    outputPrompt: "Rewrite following: {{{{InputText}}}}"
  - type: gather
    label: "Merging"
    method: "s-s0-h0-u0-aN-u"
    systemPrompt: "You merge {{{{N}}}} replies."
    userPrompt: "{{{{PrevStepOutput}}}}"
"#
    )
    .expect("write factory file");

    let factory = FactoryFile::from_file(path.to_str().expect("utf-8 path"))
        .and_then(FactoryFile::into_factory)
        .expect("factory file parses");

    let mut orchestrator =
        BeamOrchestrator::new(Arc::new(ScriptedInvoker), BeamConfig::default());
    orchestrator
        .catalog_mut()
        .register(factory)
        .expect("unique id");

    orchestrator
        .start_run(test_request("style-merge"))
        .await
        .expect("run should start");

    // The recipe leads with a free-text step.
    let status = orchestrator.wait_settled().await.expect("run exists");
    assert_eq!(
        status,
        RunStatus::AwaitingUserInput {
            step: 0,
            kind: UserInputKind::FreeText
        }
    );
    let pending = orchestrator.pending_input().await.expect("pending input");
    assert_eq!(pending.label, "Describe the style");

    orchestrator
        .supply_user_input(UserReply::Text("shorter and formal".to_string()))
        .await
        .expect("input accepted");
    assert_eq!(
        orchestrator.wait_settled().await.expect("run exists"),
        RunStatus::Completed
    );

    let output = orchestrator.final_output().await.expect("output exists");
    assert_eq!(output, "fused[Rewrite following: shorter and formal]");
}

#[tokio::test]
async fn test_guided_factory_checklist_round_trip() {
    let orchestrator = BeamOrchestrator::new(Arc::new(ScriptedInvoker), BeamConfig::default());
    orchestrator
        .start_run(test_request("guided"))
        .await
        .expect("run should start");

    let status = orchestrator.wait_settled().await.expect("run exists");
    assert_eq!(
        status,
        RunStatus::AwaitingUserInput {
            step: 1,
            kind: UserInputKind::Checklist
        }
    );

    orchestrator
        .supply_user_input(UserReply::Checklist {
            yes: vec!["keep examples".to_string()],
            no: vec!["keep history".to_string()],
        })
        .await
        .expect("input accepted");

    assert_eq!(
        orchestrator.wait_settled().await.expect("run exists"),
        RunStatus::Completed
    );
    let output = orchestrator.final_output().await.expect("output exists");
    assert!(output.contains("keep examples"));
    assert!(output.contains("keep history"));

    // Every step's output was materialized in order.
    let outputs = orchestrator.outputs().await;
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[1].step, 1);
}
