//! megatron command line.
//!
//! ```text
//! megatron check scripts/demo.txt
//! megatron run scripts/demo.txt --log-file logs/demo.csv --period 0.5
//! ```
//!
//! The binary drives the simulated bench (stage motor and ion pump supply).
//! Ctrl-C cancels a running script; the logger is stopped and the motor
//! velocity restored before exiting.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use megatron::condition::ConditionProgress;
use megatron::config::{Settings, DEFAULT_CONFIG_PATH};
use megatron::hardware::mock::SimBench;
use megatron::runner::ScriptRunner;
use megatron::script::{load_script, Interpreter, Mode};

const ION_PUMP_SCAN_PERIOD: Duration = Duration::from_secs(1);

/// Stage and ion pump script runner
#[derive(Parser)]
#[command(name = "megatron")]
#[command(about = "Run stage motion scripts with periodic signal logging")]
#[command(version)]
struct Cli {
    /// Configuration file (missing file means built-in defaults)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a script against the simulated bench
    Run {
        /// Script file
        script: PathBuf,

        /// CSV file for the periodic logger (overrides the configuration)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Logger period in seconds (overrides the configuration)
        #[arg(long)]
        period: Option<f64>,
    },
    /// Parse a script and resolve its logged signals without running it
    Check {
        /// Script file
        script: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Commands::Run {
        log_file, period, ..
    } = &cli.command
    {
        if let Some(file) = log_file {
            settings.logger.file = file.clone();
        }
        if let Some(period) = period {
            settings.logger.period_secs = *period;
        }
        settings.validate().context("invalid command line overrides")?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match cli.command {
        Commands::Run { script, .. } => run(&settings, script).await,
        Commands::Check { script } => check(&settings, script).await,
    }
}

async fn run(settings: &Settings, path: PathBuf) -> Result<()> {
    let script = load_script(&path)
        .await
        .with_context(|| format!("reading script {}", path.display()))?;

    let bench = SimBench::new();
    let scan = bench.ion_pump.start_scan(ION_PUMP_SCAN_PERIOD);

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(report_progress(progress_rx));

    let interpreter = Interpreter::new(&bench.devices(), &settings.devices)?
        .with_timing(settings.motion.timing())
        .with_progress(progress_tx);
    let mut runner = ScriptRunner::new(interpreter, &settings.logger.file, settings.logger.period());

    info!(script = %path.display(), log_file = %settings.logger.file.display(), "running script");
    let result = runner
        .run_until(&script, async {
            if tokio::signal::ctrl_c().await.is_err() {
                future::pending::<()>().await;
            }
        })
        .await;

    scan.abort();
    drop(runner);
    let _ = progress.await;

    let report = result.with_context(|| format!("script {} failed", path.display()))?;
    println!(
        "Script finished in {:.1}s; {} row(s) logged to {}",
        report.elapsed.as_secs_f64(),
        report.rows_logged,
        settings.logger.file.display()
    );
    Ok(())
}

async fn check(settings: &Settings, path: PathBuf) -> Result<()> {
    let script = load_script(&path)
        .await
        .with_context(|| format!("reading script {}", path.display()))?;
    let instructions = script.parse()?;

    let bench = SimBench::new();
    let mut interpreter = Interpreter::new(&bench.devices(), &settings.devices)?;
    interpreter.execute(&script, Mode::Prescan).await?;

    let effective = instructions.iter().filter(|i| i.is_effectful()).count();
    println!(
        "{}: {} line(s), {} hardware instruction(s)",
        path.display(),
        script.len(),
        effective
    );
    for name in interpreter.log_set().names() {
        println!("  logs {:?}", name);
    }
    Ok(())
}

async fn report_progress(mut rx: mpsc::UnboundedReceiver<ConditionProgress>) {
    while let Some(progress) = rx.recv().await {
        debug!(
            signal = %progress.name,
            current = ?progress.current,
            target = progress.target,
            fraction = ?progress.fraction,
            elapsed = ?progress.elapsed,
            "condition progress"
        );
    }
}
