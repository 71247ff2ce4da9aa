use chrono::Utc;
use clap::{Parser, Subcommand};
use health::{HealthScorer, MetricSnapshot, WeightedScorer};
use sentinel::config::SentinelConfig;
use sentinel::pipeline::Stage;
use sentinel::system::SentinelSystem;
use sentinel::telemetry::{init_tracing, TelemetryConfig};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "FIP health scoring, downtime forecasting and proactive alerting")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the refresh loops until interrupted
    Run,
    /// Run one full evaluation cycle and print the overview
    Cycle,
    /// Score a single metric snapshot
    Score {
        #[arg(long, default_value = "adhoc")]
        fip_id: String,
        /// Consent success rate, percent
        #[arg(long)]
        consent: Option<f64>,
        /// Data fetch success rate, percent
        #[arg(long)]
        data_fetch: Option<f64>,
        /// Average response time, seconds
        #[arg(long)]
        response_time: Option<f64>,
        /// Error rate, percent
        #[arg(long)]
        error_rate: Option<f64>,
    },
    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
    /// Send a test payload to every enabled webhook
    TestWebhooks,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = SentinelConfig::load(cli.config.as_deref())?;
    init_tracing(&TelemetryConfig::default().with_log_level(config.log_level.clone()))?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Cycle => {
            let system = SentinelSystem::builder(config).build()?;
            let outcome = system.run_cycle(Stage::Full).await;
            for skipped in &outcome.report.skipped {
                error!("Skipped {}: {}", skipped.fip_id, skipped.reason);
            }
            println!("{}", serde_json::to_string_pretty(&system.overview())?);
        }
        Commands::Score {
            fip_id,
            consent,
            data_fetch,
            response_time,
            error_rate,
        } => {
            let snapshot = MetricSnapshot {
                consent_success_rate: consent,
                data_fetch_success_rate: data_fetch,
                avg_response_time_seconds: response_time,
                error_rate,
                ..MetricSnapshot::new(fip_id, Utc::now())
            };
            let scorer = WeightedScorer::new(config.scoring.clone());
            println!("{}", serde_json::to_string_pretty(&scorer.assess(&snapshot))?);
        }
        Commands::CheckConfig => {
            println!("{}", config.to_toml_string()?);
            info!("Configuration is valid");
        }
        Commands::TestWebhooks => {
            let system = SentinelSystem::builder(config).build()?;
            let reports = system.test_all_webhooks().await;
            if reports.is_empty() {
                println!("No enabled webhooks");
            }
            for report in &reports {
                let status = if report.is_delivered() { "ok" } else { "FAILED" };
                println!(
                    "{:<8} {} ({} attempt(s))",
                    status, report.subscription_name, report.attempts
                );
            }
        }
    }

    Ok(())
}

async fn run(config: SentinelConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut system = SentinelSystem::builder(config).build()?;
    system.start();
    info!("Sentinel running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    if let Some(report) = system.stop().await {
        info!(
            "Flushed {} queued notification(s), {} delivery(ies) abandoned",
            report.drained, report.abandoned
        );
    }
    Ok(())
}
