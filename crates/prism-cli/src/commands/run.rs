//! `prism run` — execute one scatter/gather fusion interactively.
//!
//! Progress is rendered from the engine's event stream; when the fusion
//! recipe suspends on user input, the terminal prompts with a checklist or
//! a free-text editor and resumes the run with the answer.

use console::style;
use dialoguer::{Input, MultiSelect};

use prism_core::beam::{BeamOrchestrator, BeamRequest, RayPolicy, RunHandle, RunStatus};
use prism_core::catalog::{FactoryFile, UserInputKind};
use prism_core::events::RunEvent;
use prism_core::gather::{PendingInput, UserReply};
use prism_core::invoke::ApiDialect;
use prism_core::scatter::{ModelAssignment, RayState};

pub struct RunArgs {
    pub prompt: String,
    pub rays: usize,
    pub models: Vec<String>,
    pub gather_model: String,
    pub system: String,
    pub factory: String,
    pub factory_file: Option<String>,
    pub policy: RayPolicy,
    pub dialect: Option<ApiDialect>,
    pub base_url: Option<String>,
    pub json: bool,
}

pub async fn execute(args: RunArgs) -> Result<(), String> {
    // Load .env / .env.local if present (for API keys, etc.)
    super::load_dotenv();

    let mut orchestrator =
        super::build_orchestrator(args.policy, args.dialect, args.base_url.as_deref())?;

    let mut factory_id = args.factory.clone();
    if let Some(path) = &args.factory_file {
        let factory = FactoryFile::from_file(path)
            .and_then(FactoryFile::into_factory)
            .map_err(|e| e.to_string())?;
        factory_id = factory.factory_id.clone();
        orchestrator
            .catalog_mut()
            .register(factory)
            .map_err(|e| e.to_string())?;
        println!("📄 Registered factory '{}' from {}", factory_id, path);
    }

    let request = BeamRequest {
        ray_count: args.rays,
        assignment: if args.models.len() > 1 {
            ModelAssignment::PerRay(args.models.clone())
        } else {
            ModelAssignment::Uniform(args.models.first().cloned().unwrap_or_default())
        },
        gather_model: args.gather_model,
        factory_id,
        system_prompt: args.system,
        user_prompt: args.prompt,
        context: Default::default(),
    };

    // Render progress from the event stream while the run advances.
    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                // A lagged receiver only skips progress lines.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                RunEvent::ScatterCompleted {
                    done,
                    errored,
                    aborted,
                    ..
                } => {
                    println!(
                        "🔆 Scatter complete: {} done, {} errored, {} aborted",
                        done, errored, aborted
                    );
                }
                RunEvent::StepStarted { step, label, .. } => {
                    println!("⚙️  Step {}: {}", step + 1, label);
                }
                RunEvent::RunFailed { reason, .. } => {
                    println!("{}", style(format!("✗ {}", reason)).red());
                }
                _ => {}
            }
        }
    });

    let handle = orchestrator
        .start_run(request)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "🚀 Run {} started ({} rays, factory '{}')",
        handle.run_id, args.rays, args.factory
    );

    let result = drive(&orchestrator, &handle, args.json).await;
    printer.abort();
    result
}

/// Advance the run to completion, answering input requests interactively.
/// Ctrl-C aborts the run cooperatively.
async fn drive(
    orchestrator: &BeamOrchestrator,
    handle: &RunHandle,
    json: bool,
) -> Result<(), String> {
    loop {
        let settled = tokio::select! {
            status = orchestrator.wait_settled() => status,
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Aborting run…");
                orchestrator.stop(handle).await;
                orchestrator.wait_settled().await
            }
        };

        match settled {
            Some(RunStatus::AwaitingUserInput { .. }) => {
                let Some(pending) = orchestrator.pending_input().await else {
                    // The run moved on (or was aborted) while we were
                    // about to prompt; re-check.
                    continue;
                };
                let reply = prompt_user(&pending)?;
                match orchestrator.supply_user_input(reply).await {
                    Ok(()) => {}
                    // Aborted between prompt and answer.
                    Err(e) => println!("{}", style(format!("✗ {}", e)).yellow()),
                }
            }
            Some(RunStatus::Completed) => {
                let output = orchestrator
                    .final_output()
                    .await
                    .unwrap_or_else(|| "(empty output)".to_string());
                if json {
                    print_json(orchestrator, &handle.run_id, &output).await?;
                    return Ok(());
                }
                print_rays(orchestrator).await;
                println!();
                println!("{}", style("══ Fused result ══").bold());
                println!("{}", output);
                return Ok(());
            }
            Some(RunStatus::Failed { reason }) => {
                print_rays(orchestrator).await;
                return Err(reason);
            }
            Some(RunStatus::Aborted) => {
                println!("🛑 Run aborted");
                return Ok(());
            }
            _ => return Err("run ended in an unexpected state".to_string()),
        }
    }
}

fn prompt_user(pending: &PendingInput) -> Result<UserReply, String> {
    println!();
    println!("{}", style(format!("⏸  {}", pending.label)).bold());
    match pending.kind {
        UserInputKind::Checklist => {
            if pending.options.is_empty() {
                // Nothing parseable to pick from; fall back to free
                // selection via text.
                let text: String = Input::new()
                    .with_prompt("Selection (comma-separated)")
                    .allow_empty(true)
                    .interact_text()
                    .map_err(|e| e.to_string())?;
                let yes: Vec<String> = text
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
                return Ok(UserReply::Checklist { yes, no: vec![] });
            }
            let chosen = MultiSelect::new()
                .with_prompt("Select items (space to toggle, enter to confirm)")
                .items(&pending.options)
                .interact()
                .map_err(|e| e.to_string())?;
            let mut yes = Vec::new();
            let mut no = Vec::new();
            for (i, option) in pending.options.iter().enumerate() {
                if chosen.contains(&i) {
                    yes.push(option.clone());
                } else {
                    no.push(option.clone());
                }
            }
            Ok(UserReply::Checklist { yes, no })
        }
        UserInputKind::FreeText => {
            let text: String = Input::new()
                .with_prompt("Your instructions")
                .interact_text()
                .map_err(|e| e.to_string())?;
            Ok(UserReply::Text(text))
        }
    }
}

/// Machine-readable result: rays, step outputs, and the fused text.
async fn print_json(
    orchestrator: &BeamOrchestrator,
    run_id: &str,
    output: &str,
) -> Result<(), String> {
    let rays = orchestrator.rays().await;
    let outputs = orchestrator.outputs().await;
    let value = serde_json::json!({
        "runId": run_id,
        "status": "completed",
        "rays": rays,
        "outputs": outputs,
        "finalOutput": output,
    });
    let rendered = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
    println!("{}", rendered);
    Ok(())
}

async fn print_rays(orchestrator: &BeamOrchestrator) {
    let rays = orchestrator.rays().await;
    if rays.is_empty() {
        return;
    }
    println!();
    for ray in rays {
        let mark = match ray.state {
            RayState::Done => style("✓").green(),
            RayState::Errored => style("✗").red(),
            RayState::Aborted => style("⊘").yellow(),
            _ => style("…").dim(),
        };
        let detail = ray
            .error
            .unwrap_or_else(|| format!("{} chars", ray.text.len()));
        println!("  {} ray {} [{}] {}", mark, ray.index, ray.model, detail);
    }
}
