use anyhow::{Context, Result};
use clap::Parser;
use sast_triage::config::Config;
use sast_triage::finding::{load_findings, load_ground_truth};
use sast_triage::llm::ModelClients;
use sast_triage::pipeline::TriagePipeline;
use sast_triage::report::publish;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sast-triage",
    about = "Adjudicate static-analysis findings against a C checkout",
    version
)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: PathBuf,

    /// JSON array of findings to triage
    #[arg(long)]
    findings: PathBuf,

    /// JSON object of finding id -> human label, for metrics
    #[arg(long)]
    ground_truth: Option<PathBuf>,

    /// Where to write the run report
    #[arg(long, default_value = "sast-triage-report.json")]
    output: PathBuf,

    /// Debug logging (prompts, per-file extraction)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    sast_triage::logging::init(args.verbose);

    let config = Config::load(&args.config)?;
    config.log_effective();

    let findings = load_findings(&args.findings)?;
    let ground_truth = match (&args.ground_truth, config.triage.calculate_metrics) {
        (Some(path), true) => Some(load_ground_truth(path)?),
        (Some(_), false) => {
            tracing::info!("Metrics disabled in config; ignoring ground truth");
            None
        }
        (None, _) => None,
    };

    let clients = ModelClients::new(&config);
    let pipeline = TriagePipeline::build(&config, &clients)
        .await
        .context("Failed to set up the triage pipeline")?;

    let report = pipeline.run(&findings, ground_truth.as_ref()).await;
    publish(&report, &args.output, &mut std::io::stdout().lock())
}
