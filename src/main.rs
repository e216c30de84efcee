use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ellee_runtime::config::{ConfigError, RuntimeConfig};
use ellee_runtime::runtime::Backend;

#[derive(Parser, Debug)]
#[command(about = "Voice-commanded omni-wheel robot runtime")]
struct Args {
    /// JSON config file; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pin backend for the wheel driver
    #[arg(long, value_enum, default_value = "sysfs")]
    backend: Backend,

    /// Root of the sysfs GPIO tree
    #[arg(long)]
    gpio_root: Option<PathBuf>,

    /// Override the speed cap (percent)
    #[arg(long)]
    max_speed: Option<u8>,

    /// Override the movement watchdog timeout (seconds)
    #[arg(long)]
    watchdog_secs: Option<f64>,
}

fn load_config(args: &Args) -> Result<RuntimeConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    if let Some(max_speed) = args.max_speed {
        config.motion.max_safe_speed = max_speed;
        config.motion.default_speed = config.motion.default_speed.min(max_speed);
    }
    if let Some(secs) = args.watchdog_secs {
        config.motion.watchdog_timeout = Duration::try_from_secs_f64(secs)
            .map_err(|e| ConfigError::Invalid(format!("watchdog_secs {}: {}", secs, e)))?;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    info!("Using {:?} pin backend", args.backend);
    let pins = args.backend.open(args.gpio_root.as_deref());

    if let Err(e) = ellee_runtime::runtime::run(config, pins).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
