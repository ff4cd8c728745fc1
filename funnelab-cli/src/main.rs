use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use funnelab::experiments::{compute_results, ExperimentFilter};
use funnelab::{EngineConfig, ExperimentService, ExperimentStatus, FileExperimentRepository};

#[derive(Parser)]
#[command(name = "funnelab", about = "Inspect funnel A/B tests in a data directory")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "FUNNELAB_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// List funnels that have stored experiments
    Funnels,
    /// List a funnel's experiments
    List {
        funnel: String,
        /// Only experiments in this status (draft, running, paused, completed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Print one experiment
    Show { funnel: String, experiment: String },
    /// Print computed results and the winner, if any
    Results { funnel: String, experiment: String },
}

fn parse_status(value: &str) -> funnelab::Result<ExperimentStatus> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase())).map_err(|_| {
        funnelab::FunnelabError::Config(format!(
            "unknown status '{}': expected draft, running, paused or completed",
            value
        ))
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> funnelab::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> funnelab::Result<()> {
    let config = EngineConfig::load_or_default(&cli.data_dir);
    let repo = FileExperimentRepository::new(&cli.data_dir)?;
    let service = ExperimentService::with_config(repo, config);

    match cli.command {
        Command::Funnels => print_json(&service.repository().funnel_ids()?),
        Command::List { funnel, status } => {
            let filter = status
                .as_deref()
                .map(parse_status)
                .transpose()?
                .map(|status| ExperimentFilter {
                    status: Some(status),
                    original_step_id: None,
                });
            print_json(&service.list_experiments(&funnel, filter)?)
        }
        Command::Show { funnel, experiment } => {
            print_json(&service.get_experiment(&funnel, &experiment)?)
        }
        Command::Results { funnel, experiment } => {
            let experiment = service.get_experiment(&funnel, &experiment)?;
            let results = compute_results(&experiment);
            if let Some(winner) = results.winner() {
                tracing::info!(
                    "variant '{}' beats control by {:.1}% at {}% confidence",
                    winner.name,
                    winner.improvement,
                    winner.confidence
                );
            }
            print_json(&results)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
