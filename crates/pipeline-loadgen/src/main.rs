//! Load generator for the analysis pipeline.
//!
//! ```bash
//! # Validate a config file and print the effective snapshot
//! pipeline-loadgen check-config pipeline.toml
//!
//! # 500 requests over 20 sessions, primary crashing every 7th call
//! PIPELINE_CONFIG=pipeline.toml pipeline-loadgen run -n 500 -s 20 --primary-failure-period 7
//! ```

mod synthetic;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use pipeline::{
    AdmissionSnapshot, AnalysisPipeline, Analyzer, BreakerSnapshot, FacadeMetrics,
    PipelineConfig,
};
use serde::Serialize;
use synthetic::{SyntheticAnalyzer, TierProfile};
use tracing::{info, warn};

const SAMPLE_TEXTS: &[&str] = &[
    "철수가 밥을 먹었다.",
    "영희는 도서관에서 책을 읽었다. 민수는 공원에서 공을 찼다.",
    "오늘 날씨가 정말 좋네요! 산책하러 갈까요?",
    "회의가 끝난 뒤 우리는 점심을 먹으러 갔다.",
];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate a config file, then print it as JSON
    CheckConfig {
        path: PathBuf,
    },
    /// Drive synthetic traffic through the pipeline and print a summary
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Config file (overrides PIPELINE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total requests
    #[arg(short = 'n', long, default_value_t = 200)]
    requests: usize,

    /// Distinct sessions, assigned round-robin
    #[arg(short = 's', long, default_value_t = 10)]
    sessions: usize,

    /// Per-request deadline in ms (0 uses the configured default)
    #[arg(long, default_value_t = 0)]
    deadline_ms: u64,

    /// Delay between request launches in ms
    #[arg(long, default_value_t = 2)]
    spacing_ms: u64,

    #[arg(long, default_value_t = 80)]
    primary_latency_ms: u64,
    #[arg(long, default_value_t = 0)]
    primary_failure_period: u64,
    #[arg(long, default_value_t = 0.93)]
    primary_f1: f64,

    #[arg(long, default_value_t = 30)]
    secondary_latency_ms: u64,
    #[arg(long, default_value_t = 0)]
    secondary_failure_period: u64,
    #[arg(long, default_value_t = 0.86)]
    secondary_f1: f64,

    #[arg(long, default_value_t = 5)]
    tertiary_latency_ms: u64,
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    requests: usize,
    succeeded: usize,
    by_level: BTreeMap<String, usize>,
    by_error: BTreeMap<String, usize>,
    mean_elapsed_ms: f64,
    breakers: Vec<BreakerSnapshot>,
    admission: Option<AdmissionSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { path } => check_config(&path),
        Command::Run(args) => run(args).await,
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = PipelineConfig::load(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Explicit flag first, then `PIPELINE_CONFIG`, then built-in defaults.
fn resolve_config(flag: Option<PathBuf>) -> Result<PipelineConfig> {
    let path = flag.or_else(|| std::env::var_os("PIPELINE_CONFIG").map(PathBuf::from));
    match path {
        Some(path) => {
            info!(path = %path.display(), "Loading pipeline config");
            PipelineConfig::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(PipelineConfig::default()),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = resolve_config(args.config.clone())?;
    let names = [
        config.tiers.primary.name.clone(),
        config.tiers.secondary.name.clone(),
        config.tiers.tertiary.name.clone(),
    ];
    let profiles = [
        TierProfile {
            latency: Duration::from_millis(args.primary_latency_ms),
            failure_period: args.primary_failure_period,
            f1: Some(args.primary_f1),
        },
        TierProfile {
            latency: Duration::from_millis(args.secondary_latency_ms),
            failure_period: args.secondary_failure_period,
            f1: Some(args.secondary_f1),
        },
        TierProfile {
            latency: Duration::from_millis(args.tertiary_latency_ms),
            failure_period: 0,
            f1: None,
        },
    ];
    let analyzers: [Arc<dyn Analyzer>; 3] = [
        Arc::new(SyntheticAnalyzer::new(&names[0], profiles[0])),
        Arc::new(SyntheticAnalyzer::new(&names[1], profiles[1])),
        Arc::new(SyntheticAnalyzer::new(&names[2], profiles[2])),
    ];

    let pipeline = Arc::new(
        AnalysisPipeline::new(config, analyzers, Arc::new(FacadeMetrics))
            .context("failed to build pipeline")?,
    );
    let sessions = args.sessions.max(1);
    info!(
        requests = args.requests,
        sessions,
        "Starting load run"
    );

    let mut handles = Vec::with_capacity(args.requests);
    for i in 0..args.requests {
        let pipeline = pipeline.clone();
        let session = format!("session-{}", i % sessions);
        let text = SAMPLE_TEXTS[i % SAMPLE_TEXTS.len()];
        let deadline_ms = args.deadline_ms;
        handles.push(tokio::spawn(async move {
            pipeline.analyze(text, &session, deadline_ms).await
        }));
        if args.spacing_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.spacing_ms)).await;
        }
    }

    let mut summary = RunSummary {
        requests: args.requests,
        ..Default::default()
    };
    let mut total_elapsed_ms = 0u64;
    for joined in join_all(handles).await {
        match joined.context("request task panicked")? {
            Ok(result) => {
                summary.succeeded += 1;
                total_elapsed_ms += result.elapsed_ms;
                *summary
                    .by_level
                    .entry(result.quality_level.to_string())
                    .or_default() += 1;
            }
            Err(e) => {
                *summary.by_error.entry(e.kind().to_string()).or_default() += 1;
            }
        }
    }
    if summary.succeeded > 0 {
        summary.mean_elapsed_ms = total_elapsed_ms as f64 / summary.succeeded as f64;
    }
    summary.breakers = pipeline.breaker_snapshots();
    summary.admission = Some(pipeline.admission_snapshot());

    if !summary.by_error.is_empty() {
        warn!(errors = ?summary.by_error, "Some requests failed");
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
