mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use orchestrator::errors::OrchestratorError;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gateway", about = "Student portal orchestration gateway")]
enum CliCommand {
    /// Run the orchestrator and its admin listener
    Orchestrator(ConfigArgs),
    /// Check a config file and the secrets it references, then exit
    ValidateConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
}

fn main() -> Result<(), CliError> {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::Orchestrator(args) => {
            let config = Config::from_file(&args.config_file_path)?;

            // Sentry has to be up before the runtime starts
            let _sentry = init_logging(config.common.logging.as_ref());
            init_metrics(config.common.metrics.as_ref())?;

            tracing::info!(config = %args.config_file_path.display(), "Starting orchestrator");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(orchestrator::run(config.orchestrator))?;
        }
        CliCommand::ValidateConfig(args) => {
            let config = Config::from_file(&args.config_file_path)?;
            config.orchestrator.validate().map_err(OrchestratorError::from)?;
            orchestrator::build_service(&config.orchestrator, &|name: &str| {
                std::env::var(name).ok()
            })?;
            println!("{} is valid", args.config_file_path.display());
        }
    }

    Ok(())
}

fn init_logging(config: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let level = config.map_or("info", |logging| logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = config
        .and_then(|logging| logging.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(config: Option<&MetricsConfig>) -> Result<(), CliError> {
    let Some(config) = config else {
        return Ok(());
    };

    let recorder = metrics_exporter_statsd::StatsdBuilder::from(
        config.statsd_host.clone(),
        config.statsd_port,
    )
    .build(Some(&config.prefix))
    .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(orchestrator::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Metrics exported to statsd"
    );
    Ok(())
}
