//! Burst-capture binary: runs one convergence-gated burst and exits.

use std::path::PathBuf;
use std::process::ExitCode;

use burst_capture::{
    BurstConfig, BurstMode, Collaborators, ConvergencePolicy, DirectoryStorage, ImageFormat,
    LoggingHost, NodeAccess, Orchestrator, SessionOutcome, V4l2Driver,
};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Plain,
    Windowed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Exposure,
    ExposureWhiteBalance,
    Full,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Jpeg,
    Heic,
}

/// Capture a burst of stills once the camera has converged.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Burst mode
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Number of stills to capture
    #[arg(short = 'n', long)]
    burst_count: Option<u32>,

    /// Preview frames eligible for windowed capture
    #[arg(long)]
    window_size: Option<u32>,

    /// Convergence axes that must settle before capture
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Still image format
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Directory images are written to
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Overall session deadline in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply(&self, config: &mut BurstConfig) {
        if let Some(mode) = self.mode {
            config.mode = match mode {
                ModeArg::Plain => BurstMode::Plain,
                ModeArg::Windowed => BurstMode::Windowed,
            };
        }
        if let Some(policy) = self.policy {
            config.policy = match policy {
                PolicyArg::Exposure => ConvergencePolicy::Exposure,
                PolicyArg::ExposureWhiteBalance => ConvergencePolicy::ExposureWhiteBalance,
                PolicyArg::Full => ConvergencePolicy::Full,
            };
        }
        if let Some(format) = self.format {
            config.image_format = match format {
                FormatArg::Jpeg => ImageFormat::Jpeg,
                FormatArg::Heic => ImageFormat::Heic,
            };
        }
        if let Some(count) = self.burst_count {
            config.burst_count = count;
        }
        if self.window_size.is_some() {
            config.window_size = self.window_size;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir.clone_from(dir);
        }
        if let Some(deadline) = self.deadline_ms {
            config.deadline_ms = deadline;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&cli) {
        Ok(SessionOutcome::Completed { .. }) => ExitCode::SUCCESS,
        Ok(SessionOutcome::Failed(_)) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<SessionOutcome, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => BurstConfig::load(path)?,
        None => BurstConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    info!(
        mode = ?config.mode,
        burst_count = config.burst_count,
        policy = config.policy.label(),
        output = %config.output_dir.display(),
        "starting burst session"
    );

    let driver = V4l2Driver::new(config.facing);
    let collaborators = Collaborators {
        authorization: Box::new(NodeAccess),
        directory: Box::new(driver.clone()),
        driver: Box::new(driver),
        storage: Box::new(DirectoryStorage::new(config.output_dir.clone())),
        host: Box::new(LoggingHost),
    };

    let handle = Orchestrator::new(config, collaborators).on_foreground()?;
    Ok(handle.wait())
}
