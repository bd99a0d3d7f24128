use anyhow::{bail, Context, Result};
use clap::Parser;
use carbontrack_core::{Tracker, TrackerConfig};
use std::path::PathBuf;
use std::process::{Command, ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "carbontrack",
    about = "Run a command and report its energy use and carbon footprint"
)]
struct Args {
    /// Путь к YAML-конфигу трекера
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Каталог лог-файлов
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Подробность вывода (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Команда и её аргументы
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn tracker_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    // одна эпоха на всю команду, без прогноза
    config.epochs = 1;
    config.epochs_before_pred = 0;
    config.monitor_epochs = 1;
    config.log_dir = Some(args.log_dir.clone());
    if args.verbose > 0 {
        config.verbose = args.verbose.min(2);
    }
    Ok(config)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = tracker_config(&args)?;
    let Some((program, program_args)) = args.command.split_first() else {
        bail!("no command given");
    };

    let mut tracker = Tracker::new(config).context("failed to start carbontrack")?;
    tracing::info!("Running {program} under carbontrack");

    tracker.epoch_start();
    let status = Command::new(program).args(program_args).status();
    tracker.epoch_end();
    tracker.stop();
    drop(tracker);

    let status = status.with_context(|| format!("failed to run {program}"))?;
    if !status.success() {
        eprintln!("Error executing command: {program} ({status})");
    }
    let code = status.code().unwrap_or(1).clamp(0, 255) as u8;
    Ok(ExitCode::from(code))
}
