use std::path::PathBuf;

use keithley6485::config::AppConfig;
use keithley6485::devices::Keithley6485;
use keithley6485::experiment;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt::writer::MakeWriterExt;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Must outlive every log call
    let _guard = setup_logging();
    info!("Starting application");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(Box::new(e));
        }
    };

    let mut pico = match Keithley6485::connect(&config.port, config.baud_rate, config.timeout()) {
        Ok(pico) => pico,
        Err(e) => {
            error!("Failed to connect to Keithley 6485: {}", e);
            return Err(Box::new(e));
        }
    };

    let outcome = experiment::run_burst(&mut pico, &config.burst);
    pico.disconnect();

    match outcome {
        Ok(outcome) => {
            for (i, current) in outcome.result.readings.iter().enumerate() {
                println!("{:4}  {:+.6e} A", i, current);
            }
            info!(
                "Burst of {} points completed. Results saved to: {}",
                outcome.result.len(),
                outcome.path.display()
            );
            println!("Results saved to: {}", outcome.path.display());
        }
        Err(e) => {
            error!("Burst failed: {}", e);
            eprintln!("Burst failed: {}", e);
            return Err(Box::new(e));
        }
    }

    info!("Application shutting down");
    Ok(())
}

fn setup_logging() -> WorkerGuard {
    // Daily rotated file plus console
    let file_appender = rolling::daily("logs", "app.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking.and(std::io::stderr))
        .with_ansi(false)
        .with_level(true)
        .init();

    guard
}
