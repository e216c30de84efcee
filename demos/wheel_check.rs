// Wheel check: spins each wheel forward then reverse at low duty
//
// Usage: cargo run --example wheel_check -- --backend sim
//        cargo run --example wheel_check -- --backend sysfs --duty 20
//
// Lift the robot so the wheels spin freely before using the sysfs backend.

use std::io::{self, Write};
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use ellee_runtime::config::{PWM_HZ, PinMap, RuntimeConfig};
use ellee_runtime::motor::{WheelCommand, WheelDriver, WheelId};
use ellee_runtime::runtime::Backend;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, value_enum, default_value = "sim")]
    backend: Backend,

    #[arg(long)]
    gpio_root: Option<PathBuf>,

    /// Config file to take the pin map from
    #[arg(long)]
    config: Option<PathBuf>,

    /// Duty cycle for the test, in percent
    #[arg(long, default_value_t = 20)]
    duty: u8,

    /// Seconds per direction
    #[arg(long, default_value_t = 1.0)]
    secs: f64,

    /// Skip the confirmation prompt
    #[arg(long)]
    yes: bool,
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let (map, pwm_hz) = match &args.config {
        Some(path) => {
            let config = RuntimeConfig::load(path)?;
            (config.pins, config.motion.pwm_hz)
        }
        None => (PinMap::default(), PWM_HZ),
    };
    let duty = args.duty.min(100);
    let hold = Duration::try_from_secs_f64(args.secs)?;

    println!("Backend: {:?}, duty {}%, {:.1}s per direction", args.backend, duty, hold.as_secs_f64());
    if args.backend == Backend::Sysfs && !args.yes && !confirm("Are the wheels OFF THE GROUND?")? {
        println!("Aborted.");
        return Ok(());
    }

    let driver = WheelDriver::start(args.backend.open(args.gpio_root.as_deref()), map, pwm_hz)?;
    let pause = Duration::from_millis(500);

    for wheel in WheelId::ALL {
        for (direction, signed) in [("forward", duty as i16), ("reverse", -(duty as i16))] {
            info!("Wheel {}: {} at {}%", wheel, direction, duty);
            let mut frame = [WheelCommand::STOP; 4];
            frame[wheel.index()] = WheelCommand::from_signed(signed);
            if let Err(e) = driver.apply(frame) {
                warn!("Wheel check aborted: {}", e);
                driver.shutdown();
                return Err(e.into());
            }
            sleep(hold);
            driver.stop_all();
            sleep(pause);
        }
    }

    driver.shutdown();
    match driver.fault() {
        Some(wheel) => warn!("Wheel {} reported a hardware fault", wheel),
        None => info!("All wheels checked"),
    }
    Ok(())
}
