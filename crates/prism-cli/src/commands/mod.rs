//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! prism-core engine through `BeamOrchestrator`.

pub mod factories;
pub mod run;
pub mod validate;

use std::sync::Arc;

use prism_core::beam::{BeamConfig, BeamOrchestrator, RayPolicy};
use prism_core::invoke::{ApiDialect, HttpInvoker, HttpInvokerConfig};

/// Build an orchestrator backed by the HTTP model invoker, configured from
/// the environment with optional CLI overrides.
pub fn build_orchestrator(
    policy: RayPolicy,
    dialect: Option<ApiDialect>,
    base_url: Option<&str>,
) -> Result<BeamOrchestrator, String> {
    let mut config = HttpInvokerConfig::from_env();
    if let Some(dialect) = dialect {
        config.dialect = dialect;
    }
    if let Some(base_url) = base_url {
        config.base_url = base_url.to_string();
    }
    if config.api_key.is_empty() {
        return Err(
            "No API key found. Set PRISM_API_KEY (or ANTHROPIC_API_KEY) in the environment or a .env file"
                .to_string(),
        );
    }

    let invoker = Arc::new(HttpInvoker::new(config));
    Ok(BeamOrchestrator::new(
        invoker,
        BeamConfig { ray_policy: policy },
    ))
}

/// Load .env / .env.local if present (for API keys, etc.). Existing
/// environment variables take priority.
pub fn load_dotenv() {
    for filename in &[".env.local", ".env"] {
        let path = std::path::Path::new(filename);
        if !path.exists() {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(path) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(eq_idx) = line.find('=') {
                    let key = line[..eq_idx].trim();
                    let mut value = line[eq_idx + 1..].trim().to_string();
                    if (value.starts_with('"') && value.ends_with('"'))
                        || (value.starts_with('\'') && value.ends_with('\''))
                    {
                        value = value[1..value.len() - 1].to_string();
                    }
                    if std::env::var(key).is_err() {
                        std::env::set_var(key, &value);
                    }
                }
            }
            tracing::info!("[Cli] Loaded environment from '{}'", filename);
        }
    }
}

/// Clip a string to `max` characters for table cells.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let clipped: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", clipped)
    }
}
