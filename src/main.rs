use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowpilot::sim::{SimStepExecutor, SimTargetProvisioner};
use flowpilot_core_types::NodeId;
use flowpilot_flow_model::Flow;
use flowpilot_net_capture::{MemoryCapture, NetworkCapture, NoopCapture};
use flowpilot_run_log::MemoryLogSink;
use flowpilot_run_registry::InMemoryRunRegistry;
use flowpilot_runner::{Collaborators, NoopPrompter, Orchestrator, RunOptions};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowpilot", version, about = "Run declarative automation flows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow against the dry-run backend
    Run {
        /// Path to the flow JSON file
        flow: PathBuf,

        /// Run variable, repeatable. Values parse as JSON, falling back to
        /// plain strings.
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Navigate here before the first step
        #[arg(long)]
        start_url: Option<String>,

        /// Start traversal at this step instead of the graph root
        #[arg(long)]
        start_node: Option<String>,

        /// Global deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Include the full step log in the printed result
        #[arg(long)]
        logs: bool,

        /// Record network requests and append a capture summary
        #[arg(long)]
        capture_network: bool,

        /// Pause the run right before this step, repeatable
        #[arg(long = "break-at", value_name = "STEP_ID")]
        break_at: Vec<String>,

        /// Navigate even if a target is already open
        #[arg(long)]
        refresh: bool,
    },

    /// Check a flow file for structural problems without running it
    Validate {
        flow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    match Cli::parse().command {
        Commands::Run {
            flow,
            args,
            start_url,
            start_node,
            timeout_ms,
            logs,
            capture_network,
            break_at,
            refresh,
        } => {
            let flow = load_flow(&flow)?;
            let options = RunOptions {
                start_url,
                refresh,
                capture_network,
                return_logs: logs,
                timeout_ms,
                args: parse_args(&args)?,
                start_node_id: start_node.map(|s| NodeId::from(s.as_str())),
                break_at: break_at.iter().map(|s| NodeId::from(s.as_str())).collect(),
                plugins: Vec::new(),
            };

            let provisioner = Arc::new(SimTargetProvisioner::new());
            let capture: Arc<dyn NetworkCapture> = if capture_network {
                Arc::new(MemoryCapture::new())
            } else {
                Arc::new(NoopCapture)
            };
            let collab = Collaborators {
                executor: Arc::new(SimStepExecutor::new(provisioner.clone())),
                provisioner,
                registry: Arc::new(InMemoryRunRegistry::new()),
                log: Arc::new(MemoryLogSink::new()),
                capture,
                prompter: Arc::new(NoopPrompter),
            };

            let result = Orchestrator::new(flow, options, collab).run().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Validate { flow } => {
            let parsed = load_flow(&flow)?;
            parsed.validate()?;
            info!(flow = %parsed.id, "flow is structurally valid");
            println!(
                "ok: {} ({} nodes, {} edges, {} subflows)",
                parsed.name,
                parsed.nodes.len(),
                parsed.edges.len(),
                parsed.subflows.len()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_flow(path: &Path) -> Result<Flow> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_args(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("argument '{pair}' is not KEY=VALUE"))?;
        let value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_parse_json_with_string_fallback() {
        let map = parse_args(&[
            "count=3".to_string(),
            "items=[1,2]".to_string(),
            "name=alice".to_string(),
            "flag=true".to_string(),
        ])
        .unwrap();
        assert_eq!(map.get("count"), Some(&json!(3)));
        assert_eq!(map.get("items"), Some(&json!([1, 2])));
        assert_eq!(map.get("name"), Some(&json!("alice")));
        assert_eq!(map.get("flag"), Some(&json!(true)));
    }

    #[test]
    fn malformed_arg_is_rejected() {
        assert!(parse_args(&["no-equals".to_string()]).is_err());
    }
}
