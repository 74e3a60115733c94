//! oclkit CLI application
//!
//! Runs the bundled compute programs (vector add, image rotation) through a
//! compute session and dumps the platforms a driver exposes.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use oclkit_session::{DeviceType, DriverKind, SessionConfig};
use std::path::PathBuf;
use tracing::{debug, error};

mod commands;

use commands::{AddCommand, PlatformsCommand, RotateCommand};

/// oclkit - host-side compute sessions for OpenCL-style devices
#[derive(Parser)]
#[command(name = "oclkit")]
#[command(about = "Run compute kernels through an OpenCL-style session")]
#[command(long_about = r#"
oclkit drives a compute device through the full session lifecycle: device
selection, context creation, program build, buffer allocation, dispatch,
read-back and ordered teardown.

Examples:
  # Add two 1000-element vectors on the default GPU
  oclkit add --input-size 1000

  # Same, one work-item per work-group, on a CPU device
  oclkit --device-type cpu add --input-size 1000 --local-size 1

  # Rotate a 6x6 image by 90 degrees
  oclkit rotate --width 6 --height 6 --angle-degrees 90

  # List platforms and devices
  oclkit platforms
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Device type filter (cpu, gpu, accelerator, custom, default, all)
    #[arg(short, long, value_name = "TYPE", global = true)]
    device_type: Option<DeviceType>,

    /// Driver to open (reference, opencl)
    #[arg(long, value_name = "DRIVER", global = true)]
    driver: Option<DriverKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true, default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(long, value_name = "FORMAT", global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Add two vectors on the device
    Add(AddCommand),

    /// Rotate an image on the device
    Rotate(RotateCommand),

    /// Show platform and device information
    #[command(alias = "info")]
    Platforms(PlatformsCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.log_format);

    let result = load_configuration(&cli).and_then(|config| match &cli.command {
        Some(Commands::Add(cmd)) => cmd.execute(&config),
        Some(Commands::Rotate(cmd)) => cmd.execute(&config),
        Some(Commands::Platforms(cmd)) => cmd.execute(&config),
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    });

    if let Err(e) = result {
        error!("Command failed: {}", e);
        for cause in e.chain().skip(1) {
            error!("  Caused by: {}", cause);
        }
        std::process::exit(1);
    }

    Ok(())
}

/// Load the session configuration and apply command-line overrides.
fn load_configuration(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => SessionConfig::from_env().context("invalid OCLKIT_* environment")?,
    };
    if let Some(device_type) = cli.device_type {
        config.device_type = device_type;
    }
    if let Some(driver) = cli.driver {
        config.driver = driver;
    }
    config.validate().context("invalid configuration")?;
    debug!(?config, "configuration resolved");
    Ok(config)
}

/// Install the tracing subscriber. `RUST_LOG` wins over `--log-level`.
fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init(),
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}
