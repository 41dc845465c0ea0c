//! ---
//! kpp_section: "01-core-functionality"
//! kpp_subsection: "binary"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Binary entrypoint for the KPP daemon."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kpp_common::config::AppConfig;
use kpp_common::logging::init_tracing;
use kpp_core::{ControllerRuntime, LoopOptions, PlantLoop, RunReport};
use kpp_metrics::{new_registry, spawn_http_server, DaemonMetrics, LoopMetrics};
use kpp_sim::ScenarioScript;
use kpp_transient::TransientMetrics;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Ticks simulated when neither a limit nor a scenario duration is given.
const DEFAULT_BATCH_TICKS: u64 = 2_400;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("KPP ", env!("CARGO_PKG_VERSION")),
    about = "KPP transient-event controller daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the controller against the plant model")]
    Run(RunArgs),
    #[command(about = "Load and validate the configuration, then print it")]
    CheckConfig,
    #[command(about = "Parse and validate a scenario script")]
    CheckScenario {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Debug, Default, clap::Args)]
struct RunArgs {
    #[arg(long, help = "Stop after this many control ticks")]
    ticks: Option<u64>,

    #[arg(long, value_name = "FILE", help = "Scenario script overriding simulation.scenario_file")]
    scenario: Option<PathBuf>,

    #[arg(long, help = "Request a startup before the first tick")]
    start: bool,

    #[arg(long, help = "Pace ticks against the wall clock")]
    realtime: bool,

    #[arg(long, value_name = "FILE", help = "Write the run report to FILE instead of stdout")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/kpp.toml"));
    candidates.push(PathBuf::from("configs/kpp.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    let load_duration = load_started.elapsed();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let registry = new_registry();
            let daemon_metrics = DaemonMetrics::new(registry.clone())?;
            daemon_metrics.observe_config_load(load_duration.as_secs_f64());
            daemon_metrics.inc_start();
            init_tracing("kppd", &config.logging)?;
            match &loaded.source {
                Some(path) => info!(config_path = %path.display(), "configuration loaded"),
                None => info!("no configuration file found; running with defaults"),
            }
            run_daemon(config, args, daemon_metrics).await?;
        }
        Commands::CheckConfig => {
            let rendered = serde_json::to_string_pretty(&config)
                .context("failed to render configuration")?;
            match &loaded.source {
                Some(path) => println!("configuration OK: {}", path.display()),
                None => println!("configuration OK: built-in defaults"),
            }
            println!("{}", rendered);
        }
        Commands::CheckScenario { path } => {
            let script = ScenarioScript::from_path(&path)?;
            println!(
                "scenario OK: {} ({} steps, duration {})",
                script.name,
                script.steps.len(),
                script
                    .duration
                    .map(|seconds| format!("{:.1}s", seconds))
                    .unwrap_or_else(|| "unbounded".to_owned())
            );
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, args: RunArgs, daemon_metrics: DaemonMetrics) -> Result<()> {
    let registry = daemon_metrics.registry();
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };
    let transient_metrics = TransientMetrics::new(registry.clone())?;
    let loop_metrics = LoopMetrics::new(registry)?;

    let scenario_path = args
        .scenario
        .clone()
        .or_else(|| config.simulation.scenario_file.clone());
    let scenario = scenario_path
        .as_deref()
        .map(ScenarioScript::from_path)
        .transpose()?;

    let runtime = ControllerRuntime::spawn(config.transient.clone(), Some(transient_metrics));
    let mut plant_loop = PlantLoop::new(&config.simulation, &config.transient, runtime.handle())?
        .with_metrics(loop_metrics);
    if let Some(script) = &scenario {
        plant_loop = plant_loop.with_scenario(script);
    }

    let bounded = args.ticks.is_some()
        || args.realtime
        || scenario.as_ref().is_some_and(|script| script.duration.is_some());
    let options = LoopOptions {
        max_ticks: if bounded {
            args.ticks
        } else {
            Some(DEFAULT_BATCH_TICKS)
        },
        realtime: args.realtime,
        initiate_startup: args.start,
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let signal_task = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received; stopping plant loop");
                let _ = shutdown_tx.send(());
            }
            Err(err) => warn!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    info!(
        scenario = scenario.as_ref().map(|script| script.name.as_str()).unwrap_or("none"),
        max_ticks = ?options.max_ticks,
        realtime = options.realtime,
        "plant loop starting"
    );
    let report = plant_loop.run(options, shutdown_rx).await;
    signal_task.abort();
    runtime.shutdown().await?;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    write_report(&report?, args.report.as_ref())
}

fn write_report(report: &RunReport, path: Option<&PathBuf>) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(report).context("failed to serialise run report")?;
    match path {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write run report {}", path.display()))?;
            info!(path = %path.display(), "run report written");
        }
        None => println!("{}", rendered),
    }
    Ok(())
}
