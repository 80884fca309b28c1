use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use refinement::capability::{RefinementCapability, ScriptedCapability};
use refinement::config::OrchestratorConfig;
use refinement::error::OrchestratorError;
use refinement::orchestrator::RefinementOrchestrator;
use tracing::{error, info, warn};

use refine_agent::config::{check_endpoint, RunnerConfig};
use refine_agent::{FsContentStore, HttpCapability};

/// Exit code when the quality gate blocks assembly.
const GATE_BLOCKED_EXIT: i32 = 2;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Markdown document to refine
    #[arg(long)]
    document: PathBuf,

    /// TOML orchestrator config (REFINE_* env vars override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where the refined document, history and reports are written
    #[arg(long, default_value = "refined")]
    output_dir: PathBuf,

    /// Skip the model endpoint and echo every unit unchanged
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refine_agent=info,refinement=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = OrchestratorConfig::load(args.config.as_deref()).context("Invalid orchestrator config")?;

    let capability: Arc<dyn RefinementCapability> = if args.dry_run {
        info!("Dry run: units are echoed unchanged");
        Arc::new(ScriptedCapability::echo())
    } else {
        let runner = RunnerConfig::default();
        if !check_endpoint(&runner.endpoint_url).await {
            warn!(url = %runner.endpoint_url, "Endpoint not reachable, generation rounds will fail");
        }
        info!(url = %runner.endpoint_url, model = %runner.model, "Using chat endpoint");
        Arc::new(HttpCapability::new(runner).context("Failed to build HTTP client")?)
    };

    let store = FsContentStore::new(args.document.clone(), args.output_dir.clone());
    let orchestrator = RefinementOrchestrator::new(config, capability)?;

    match orchestrator.run_with_store(&store).await {
        Ok(outcome) => {
            for report in &outcome.report.risk_reports {
                info!("{}", report.summary_line());
            }
            info!(output = %args.output_dir.display(), "{}", outcome.report.summary_line());
            Ok(())
        }
        Err(OrchestratorError::Gate(failure)) => {
            error!(defects = failure.defects.len(), "{}", failure);
            error!(output = %args.output_dir.display(), "Reports written, document not assembled");
            std::process::exit(GATE_BLOCKED_EXIT);
        }
        Err(e) => Err(e.into()),
    }
}
