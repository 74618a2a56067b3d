mod config;
mod error;
mod prereq;
mod resources;
mod restart;
mod runner;
mod service;
mod signals;
mod supervisor;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{Config, LoggingConfig};
use runner::{ServiceRunner, UnitSpec, SERVICE_OUTPUT_TARGET};
use std::path::{Path, PathBuf};
use supervisor::Supervisor;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (.yaml, .yml or .toml)
    #[arg(short, long, global = true, default_value = common::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check prerequisites, then supervise all services (default)
    Run,
    /// Validate the configuration and startup prerequisites, then exit
    Check,
    /// Restart loop for a single service, launched by the supervisor
    #[command(name = "run-service", hide = true)]
    RunService {
        #[arg(long)]
        unit: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config).await,
        Commands::Check => {
            let config = Config::from_file(&cli.config)?;
            check_prerequisites(&config)?;
            println!("Configuration and prerequisites OK");
            Ok(())
        }
        Commands::RunService { unit } => run_service(&unit).await,
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)?;
    setup_logging(&config.logging)?;
    log::info!("Starting portald with {:?}...", config_path);

    check_prerequisites(&config)?;

    let shutdown = signals::install_shutdown_handler()?;
    let exe = std::env::current_exe().context("Cannot locate the portald executable")?;
    let mut supervisor = Supervisor::new(exe, config.units());
    supervisor.start()?;

    let exits = supervisor.wait(shutdown).await;
    log::info!("All {} runners have exited", exits.len());
    Ok(())
}

fn check_prerequisites(config: &Config) -> anyhow::Result<()> {
    if let Err(e) = prereq::check(config) {
        log::error!("Startup prerequisite missing: {}", e);
        let remedy = prereq::remedy(&e);
        return Err(anyhow::Error::new(e).context(remedy));
    }
    Ok(())
}

async fn run_service(payload: &str) -> anyhow::Result<()> {
    let unit: UnitSpec = serde_json::from_str(payload).context("Invalid unit payload")?;
    setup_logging(&unit.logging)?;

    let shutdown = signals::install_shutdown_handler()?;
    let outcome = ServiceRunner::new(unit).run(shutdown).await;

    log::logger().flush();
    std::process::exit(outcome.exit_code());
}

fn setup_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let level: log::LevelFilter = logging
        .level
        .parse()
        .with_context(|| format!("Invalid log level: {}", logging.level))?;

    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    let mut main_log = fern::Dispatch::new().chain(std::io::stdout());
    if let Some(path) = &logging.output {
        main_log = main_log.chain(
            fern::log_file(path).with_context(|| format!("Cannot open log file {:?}", path))?,
        );
    }

    let dispatch = match &logging.service_output {
        // Service output file: Filter IN service_output, and keep it out of the main log
        Some(path) => {
            let service_log = fern::Dispatch::new()
                .filter(|metadata| metadata.target() == SERVICE_OUTPUT_TARGET)
                .chain(
                    fern::log_file(path)
                        .with_context(|| format!("Cannot open service log file {:?}", path))?,
                );
            base_config
                .chain(main_log.filter(|metadata| metadata.target() != SERVICE_OUTPUT_TARGET))
                .chain(service_log)
        }
        None => base_config.chain(main_log),
    };

    dispatch.apply()?;
    Ok(())
}
