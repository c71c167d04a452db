//! Tercios - a load generator for OTLP-compatible trace receivers.
//!
//! Tercios synthesizes realistic distributed-trace batches at configurable
//! rate, concurrency, and shape, optionally mutates them through declarative
//! chaos policies, and exports them over OTLP (gRPC or HTTP) or to a dry-run
//! sink for local inspection.

use std::sync::Arc;

use clap::Parser as _;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod chaos;
mod cli;
mod config;
mod error;
mod exporter;
mod generator;
mod metrics;
mod model;
mod pipeline;
mod scenario;

use self::chaos::{seeded_decider, ChaosConfig, ChaosEngine};
use self::cli::Cli;
use self::error::GenericError;
use self::exporter::{DryRunExporterFactory, DryRunOutput, OtlpExporterFactory};
use self::generator::TraceGenerator;
use self::model::ExporterFactory;
use self::pipeline::{BatchStage, ChaosStage, ConcurrencyRunner, GeneratorStage, Pipeline, RunOptions, RunSignal, ScenarioStage};
use self::scenario::{ScenarioConfig, ScenarioGenerator};

fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("pipeline failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), GenericError> {
    let config = cli.load_config()?;

    let output: DryRunOutput = cli.output.parse()?;
    if !cli.dry_run && output != DryRunOutput::Summary {
        return Err(anyhow::anyhow!("-o/--output={} requires --dry-run", output));
    }

    let factory: Arc<dyn ExporterFactory> = if cli.dry_run {
        Arc::new(DryRunExporterFactory::stdout(output))
    } else {
        Arc::new(OtlpExporterFactory::from_config(&config.endpoint))
    };

    let mut stages: Vec<Box<dyn BatchStage>> = Vec::new();
    match &cli.scenario_file {
        Some(path) => {
            let definition = ScenarioConfig::load_from_json(path)?.build()?;
            info!(scenario = %definition.name, "Loaded scenario.");
            stages.push(Box::new(ScenarioStage::new(ScenarioGenerator::new(definition))));
        }
        None => {
            stages.push(Box::new(GeneratorStage::new(TraceGenerator::from_config(&config.generator))));
        }
    }

    if let Some(path) = &cli.chaos_policies_file {
        let mut chaos_config = ChaosConfig::load_from_json(path)?;
        if cli.chaos_seed != 0 {
            chaos_config.seed = cli.chaos_seed;
        }
        let engine = ChaosEngine::new(&chaos_config)?;
        info!(policies = chaos_config.policies.len(), seed = chaos_config.seed, "Loaded chaos policies.");
        stages.push(Box::new(ChaosStage::new(engine, seeded_decider(chaos_config.seed))));
    }

    let pipeline = Arc::new(Pipeline::new(stages));
    let runner = ConcurrencyRunner::new(config.concurrency.exporters, config.requests.per_exporter);
    let options = RunOptions {
        request_interval: config.requests.interval.0,
        request_duration: config.requests.run_for.0,
    };

    // Interrupt and termination signals cancel the run; workers notice at
    // their next suspension point and the summary is still printed.
    let signal = RunSignal::new();
    spawn_signal_handler(signal.clone());

    info!(
        workers = runner.workers(),
        requests_per_worker = runner.requests_per_worker(),
        "Starting pipeline."
    );

    let (summary, result) = runner.run(pipeline, factory, options, &signal).await;

    let rendered = metrics::format_summary(&summary);
    if cli.dry_run && output == DryRunOutput::Json {
        // Keep stdout machine-parseable; the summary goes to stderr.
        eprintln!("{}", rendered);
    } else {
        println!("{}", rendered);
    }

    result
}

fn spawn_signal_handler(signal: RunSignal) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping workers.");
        signal.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
