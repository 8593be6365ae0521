//! Prism CLI — run scatter/gather fusion from the terminal.
//!
//! Reuses the same core engine (prism-core) that front-ends embed
//! directly: rays fan out in parallel, then a fusion recipe merges them,
//! pausing for checklist or free-text input when the recipe asks for it.

mod commands;

use clap::{Parser, Subcommand};

use prism_core::beam::RayPolicy;
use prism_core::invoke::ApiDialect;

/// Prism CLI — parallel model replies, fused into one answer
#[derive(Parser)]
#[command(name = "prism", version, about = "Prism CLI — parallel model replies, fused into one answer")]
pub struct Cli {
    /// Quick prompt mode: scatter, fuse with the default factory, print.
    /// Example: prism -p "Explain the borrow checker"
    #[arg(short = 'p', long = "prompt")]
    prompt: Option<String>,

    /// Model used in quick prompt mode (rays and fusion alike)
    #[arg(long, env = "PRISM_MODEL", default_value = "claude-sonnet-4-5")]
    model: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scatter/gather fusion
    Run {
        /// The user prompt every ray answers
        prompt: String,

        /// Number of parallel rays
        #[arg(long, short = 'n', default_value_t = 3)]
        rays: usize,

        /// Ray model(s); repeat to assign models per ray (cycled when
        /// fewer than --rays)
        #[arg(long = "model", short = 'm', env = "PRISM_MODEL", default_value = "claude-sonnet-4-5")]
        models: Vec<String>,

        /// Model for the fusion steps (defaults to the first ray model)
        #[arg(long)]
        gather_model: Option<String>,

        /// System prompt shared by every ray
        #[arg(long, short = 's', default_value = "")]
        system: String,

        /// Fusion factory id (see `prism factories`)
        #[arg(long, short = 'f', default_value = "fuse")]
        factory: String,

        /// YAML file with a user-defined factory, registered before the run
        #[arg(long)]
        factory_file: Option<String>,

        /// Fail the run unless every ray completes
        #[arg(long, conflicts_with = "min_rays")]
        require_all: bool,

        /// Minimum number of successful rays required for fusion
        #[arg(long, default_value_t = 1)]
        min_rays: usize,

        /// API dialect: anthropic | openai
        #[arg(long, env = "PRISM_API_DIALECT")]
        dialect: Option<String>,

        /// API base URL override
        #[arg(long, env = "PRISM_BASE_URL")]
        base_url: Option<String>,

        /// Print the run result (rays, step outputs, fused text) as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available fusion factories
    Factories,

    /// Validate a factory YAML file without running it
    Validate {
        /// Path to the factory YAML file
        file: String,
    },
}

fn parse_dialect(value: &str) -> Result<ApiDialect, String> {
    match value {
        "anthropic" => Ok(ApiDialect::Anthropic),
        "openai" => Ok(ApiDialect::OpenAi),
        other => Err(format!(
            "Invalid dialect: {}. Use 'anthropic' or 'openai'",
            other
        )),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prism_core=warn,prism_cli=info".into()),
        )
        .init();

    let result = if let Some(prompt_text) = cli.prompt {
        // ── Quick prompt mode: prism -p "question" ──────────────────
        commands::run::execute(commands::run::RunArgs {
            prompt: prompt_text,
            rays: 3,
            models: vec![cli.model.clone()],
            gather_model: cli.model,
            system: String::new(),
            factory: prism_core::catalog::DEFAULT_FACTORY_ID.to_string(),
            factory_file: None,
            policy: RayPolicy::AtLeast(1),
            dialect: None,
            base_url: None,
            json: false,
        })
        .await
    } else if let Some(command) = cli.command {
        match command {
            Commands::Run {
                prompt,
                rays,
                models,
                gather_model,
                system,
                factory,
                factory_file,
                require_all,
                min_rays,
                dialect,
                base_url,
                json,
            } => {
                let dialect = match dialect.as_deref().map(parse_dialect).transpose() {
                    Ok(d) => d,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                };
                let policy = if require_all {
                    RayPolicy::RequireAll
                } else {
                    RayPolicy::AtLeast(min_rays)
                };
                let gather_model = gather_model
                    .or_else(|| models.first().cloned())
                    .unwrap_or_default();
                commands::run::execute(commands::run::RunArgs {
                    prompt,
                    rays,
                    models,
                    gather_model,
                    system,
                    factory,
                    factory_file,
                    policy,
                    dialect,
                    base_url,
                    json,
                })
                .await
            }

            Commands::Factories => commands::factories::list().await,

            Commands::Validate { file } => commands::validate::run(&file).await,
        }
    } else {
        // No prompt and no subcommand — show help
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        Ok(())
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
