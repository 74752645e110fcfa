// Module declarations for the application's core components
pub mod error;     // Protocol errors and error helpers
pub mod channels;  // Inter-component communication channels
pub mod config;    // Configuration management
pub mod options;   // Command line options parsing
pub mod prelude;   // Common imports and types
pub mod pvoutput;  // PVOutput upload client
pub mod samil;     // Samil inverter protocol implementation
pub mod scheduler; // Periodic inverter polling
pub mod utils;     // Utility functions

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::pvoutput::PvOutput;
use crate::scheduler::Scheduler;
use std::time::Duration;

/// Running components of the bridge
#[derive(Clone)]
pub struct Components {
    pub scheduler: Scheduler,        // Inverter discovery and polling
    pub pvoutput: Option<PvOutput>,  // Optional upload client
}

impl Components {
    /// Stops the scheduler first so nothing new is queued for upload.
    pub fn stop(&self) {
        info!("Stopping all components...");
        self.scheduler.stop();
        if let Some(pvoutput) = &self.pvoutput {
            pvoutput.stop();
        }
    }
}

fn init_logging() {
    // the effective level is narrowed by log::set_max_level once the config is read
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

fn apply_loglevel(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }

    match level.parse::<log::LevelFilter>() {
        Ok(filter) => log::set_max_level(filter),
        Err(_) => warn!("Unknown loglevel {}, staying at info", level),
    }
}

/// Main application entry point
pub async fn app(options: Options) -> Result<()> {
    init_logging();
    info!("samil-bridge {} starting with config file: {}", CARGO_PKG_VERSION, options.config_file);

    let config = ConfigWrapper::new(options.config_file.clone())?;
    apply_loglevel(config.loglevel());

    if options.probe {
        return probe(&config).await;
    }

    let channels = Channels::new();

    info!("Initializing components...");
    let pvoutput = match config.pvoutput() {
        Some(c) => Some(PvOutput::new(c.clone(), channels.clone())),
        None => {
            warn!("PVOutput disabled, readings will only be logged");
            None
        }
    };
    let pvoutput_handle = pvoutput.clone().map(|pvoutput| {
        tokio::spawn(async move {
            if let Err(e) = pvoutput.start().await {
                error!("PVOutput task failed: {}", e);
            }
        })
    });

    let scheduler = Scheduler::new(config.clone(), channels.clone());
    let scheduler_clone = scheduler.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler_clone.start().await {
            error!("Scheduler task failed: {}", e);
        }
    });

    let components = Components {
        scheduler,
        pvoutput,
    };

    info!("Waiting for shutdown signal...");
    match options.runtime {
        Some(secs) => tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("Runtime of {}s reached", secs),
            res = tokio::signal::ctrl_c() => log_signal(res),
        },
        None => log_signal(tokio::signal::ctrl_c().await),
    }

    components.stop();

    if let Err(e) = scheduler_handle.await {
        error!("Error waiting for scheduler task: {}", e);
    }
    if let Some(handle) = pvoutput_handle {
        if let Err(e) = handle.await {
            error!("Error waiting for PVOutput task: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn log_signal(res: std::io::Result<()>) {
    match res {
        Ok(()) => info!("Shutdown signal received, stopping components..."),
        Err(e) => error!("Failed to listen for ctrl+c: {}", e),
    }
}

/// Connects to a single inverter, prints what it reports and disconnects.
pub async fn probe(config: &ConfigWrapper) -> Result<()> {
    let mut listener =
        InverterListener::bind(config.discovery().clone(), config.inverter()).await?;
    let inverter = listener.connect().await?;
    listener.close();

    let model = inverter.request_model_info().await?;
    let reading = inverter.request_values().await?;

    println!("inverter: {}", inverter.addr());
    println!("model info: {}", model);
    println!("{}", serde_json::to_string_pretty(&reading)?);

    inverter.close().await?;
    Ok(())
}
