use clap::{Args, Parser};
use std::path::PathBuf;
use std::process;

mod config;
use config::{Config, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
enum CliCommand {
    /// Run the relay
    Run(RunArgs),
    /// Show all metrics definitions as markdown table
    ShowMetrics,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("Failed to load config file: {0}")]
    ConfigLoadError(#[from] config::ConfigError),
    #[error("Failed to create runtime: {0}")]
    RuntimeError(#[from] std::io::Error),
}

fn main() {
    init_tracing();

    if let Err(e) = cli() {
        tracing::error!(error = %e, "Startup error");
        process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    match CliCommand::parse() {
        CliCommand::Run(args) => {
            let config = Config::from_file(&args.base.config_file_path)?;
            init_statsd_recorder("flagrelay", config.common.metrics);

            run_async(config.relay)
        }
        CliCommand::ShowMetrics => {
            println!(
                "{}",
                shared::metrics_defs::markdown_table(relay::metrics_defs::ALL_METRICS)
            );
            Ok(())
        }
    }
}

fn run_async(relay_config: relay::config::Config) -> Result<(), CliError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if let Err(e) = rt.block_on(relay::run(relay_config)) {
        tracing::error!(error = %e, "Runtime error");
        process::exit(exit_code(&e));
    }
    Ok(())
}

fn exit_code(e: &relay::RunError) -> i32 {
    match e {
        relay::RunError::Config(_) => 1,
        relay::RunError::Seed(_) => 2,
        _ => 1,
    }
}

pub fn init_statsd_recorder(prefix: &str, metrics_config: Option<MetricsConfig>) {
    if let Some(MetricsConfig {
        statsd_host,
        statsd_port,
    }) = metrics_config
    {
        let recorder = StatsdBuilder::from(statsd_host, statsd_port)
            .build(Some(prefix))
            .expect("Could not create StatsdRecorder");

        metrics::set_global_recorder(recorder).expect("Could not set global metrics recorder")
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[derive(Args, Debug, Clone)]
struct BaseArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    base: BaseArgs,
}
