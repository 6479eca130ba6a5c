use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tokenflow_engine::{
    config::SimulationConfig,
    rng::FlowRng,
    sampler::{group_rate, sample_requests},
    RunRecord, SimulationTelemetry, TrafficSimulation,
};
use tokio::{
    runtime::Runtime,
    time::{interval, Instant, MissedTickBehavior},
};

#[derive(Parser, Debug)]
#[command(name = "tokenflow", version, about = "Seeded LLM request traffic simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a simulation and writes its run record.
    Run(RunArgs),
    /// Loads and validates a configuration.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Prints the routing graph laid out for a canvas.
    Graph {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        width: Option<f64>,
        #[arg(long)]
        height: Option<f64>,
    },
    /// Previews per-group request volumes with the configured seed.
    Forecast {
        #[arg(long)]
        config: PathBuf,
        /// Seconds per interval.
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        #[arg(long, default_value_t = 10)]
        intervals: usize,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Simulated seconds per tick.
    #[arg(long, default_value_t = 1.0 / 60.0)]
    dt: f64,
    /// Paces ticks against the wall clock instead of running as fast as possible.
    #[arg(long)]
    realtime: bool,
    /// Overrides the configured seed.
    #[arg(long)]
    seed: Option<u32>,
    /// Run record destination; stdout when omitted.
    #[arg(long)]
    output: Option<PathBuf>,
    /// JSON-lines log file.
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// JSON-lines lifecycle event file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    id: String,
    name: String,
    seed: u32,
    duration_seconds: f64,
    max_concurrent: usize,
    groups: usize,
    users: u64,
    router_layers: usize,
    routers_enabled: usize,
    models: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct GroupForecast {
    group_id: String,
    profile: String,
    rate: f64,
    expected_per_interval: f64,
    counts: Vec<u64>,
    total: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => Runtime::new()?.block_on(handle_run(args)),
        Commands::Validate { config } => {
            let config = SimulationConfig::load(&config)?;
            println!("{}", serde_json::to_string_pretty(&summarize(&config))?);
            Ok(())
        }
        Commands::Graph {
            config,
            width,
            height,
        } => {
            let config = SimulationConfig::load(&config)?;
            let width = width.unwrap_or(config.canvas.width);
            let height = height.unwrap_or(config.canvas.height);
            let simulation = TrafficSimulation::builder(config)
                .canvas(width, height)
                .build()?;
            let graph = simulation.graph().context("graph was not built")?;
            println!("{}", serde_json::to_string_pretty(graph)?);
            Ok(())
        }
        Commands::Forecast {
            config,
            interval,
            intervals,
        } => {
            anyhow::ensure!(
                interval.is_finite() && interval > 0.0,
                "interval must be a positive number of seconds"
            );
            let config = SimulationConfig::load(&config)?;
            let forecast = forecast(&config, interval, intervals)?;
            println!("{}", serde_json::to_string_pretty(&forecast)?);
            Ok(())
        }
    }
}

fn summarize(config: &SimulationConfig) -> ConfigSummary {
    let layers = config.enabled_layers();
    ConfigSummary {
        id: config.id.clone(),
        name: config.name.clone(),
        seed: config.seed,
        duration_seconds: config.duration_seconds,
        max_concurrent: config.max_concurrent,
        groups: config.groups.len(),
        users: config.user_count(),
        router_layers: layers.len(),
        routers_enabled: layers.iter().map(Vec::len).sum(),
        models: config.models.iter().map(|model| model.id.clone()).collect(),
    }
}

fn forecast(
    config: &SimulationConfig,
    interval: f64,
    intervals: usize,
) -> Result<Vec<GroupForecast>> {
    let mut rng = FlowRng::new(config.seed);
    config
        .groups
        .iter()
        .map(|group| {
            let profile = config
                .profile(&group.profile)
                .with_context(|| format!("group {} references unknown profile", group.id))?;
            let rate = group_rate(group.size, profile.rps_per_user);
            let counts: Vec<u64> = (0..intervals)
                .map(|_| sample_requests(rate, interval, profile.distribution, &mut rng))
                .collect();
            Ok(GroupForecast {
                group_id: group.id.clone(),
                profile: profile.id.clone(),
                rate,
                expected_per_interval: rate * interval,
                total: counts.iter().sum(),
                counts,
            })
        })
        .collect()
}

fn build_telemetry(args: &RunArgs) -> Result<SimulationTelemetry> {
    let level = LogLevel::parse(&args.log_level)
        .with_context(|| format!("unknown log level {}", args.log_level))?;
    let mut builder = SimulationTelemetry::builder("tokenflow").min_level(level);
    if let Some(path) = &args.log {
        builder = builder.log_path(path);
    }
    if let Some(path) = &args.events {
        let publisher = FileEventPublisher::new(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        builder = builder.event_publisher(Arc::new(publisher));
    }
    builder.build()
}

async fn handle_run(args: RunArgs) -> Result<()> {
    anyhow::ensure!(
        args.dt.is_finite() && args.dt > 0.0,
        "dt must be a positive number of seconds"
    );
    let mut config = SimulationConfig::load(&args.config)?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    let telemetry = build_telemetry(&args)?;
    let mut simulation = TrafficSimulation::builder(config)
        .telemetry(telemetry.clone())
        .build()?;
    simulation.mark_ready()?;

    let record = if args.realtime {
        run_realtime(&mut simulation, args.dt).await?
    } else {
        simulation.run_headless(args.dt)?
    };

    let rendered = serde_json::to_string_pretty(&record)?;
    match &args.output {
        Some(path) => {
            write_record(path, &rendered)?;
            telemetry.log(
                LogLevel::Info,
                "cli.record.written",
                json!({ "run_id": record.id(), "path": path }),
            )?;
            eprintln!("{}", headline(&record));
        }
        None => println!("{rendered}"),
    }
    telemetry.flush().await
}

async fn run_realtime(simulation: &mut TrafficSimulation, dt: f64) -> Result<RunRecord> {
    simulation.start()?;
    let mut ticker = interval(Duration::from_secs_f64(dt));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    let mut reported_second = 0_u64;
    while !simulation.is_complete() {
        ticker.tick().await;
        let now = Instant::now();
        let report = simulation.tick(now.duration_since(last).as_secs_f64());
        last = now;
        let state = simulation.state();
        let second = state.elapsed.floor() as u64;
        if second > reported_second || simulation.is_complete() {
            reported_second = second;
            eprintln!(
                "[{:>5.1}%] {:<5} live={:<3} forwards={} returns={}{}",
                simulation.progress() * 100.0,
                report.phase.label(),
                state.live_signals,
                state.totals.forwards,
                state.totals.returns,
                if report.capped { " (capped)" } else { "" },
            );
        }
    }
    Ok(simulation.finalize()?)
}

fn write_record(path: &Path, rendered: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, rendered).with_context(|| format!("writing run record {}", path.display()))
}

fn headline(record: &RunRecord) -> String {
    let totals = record.totals();
    format!(
        "run {}: {} forwards, {} tokens, ${:.4} model + ${:.4} commission, {:.2} Wh ({:.1} gCO2e)",
        record.id(),
        totals.forwards,
        totals.total_tokens,
        totals.model_cost,
        totals.commission,
        totals.energy_wh,
        record.sustainability().co2e_grams,
    )
}
