use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use serde::Serialize;

use jobq_cli::cli::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};
use jobq_cli::commands::{self, Context, EXIT_INVALID_INPUT, EnqueueOverrides};
use jobq_cli::dashboard;
use jobq_cli::paths::DataDir;

#[tokio::main]
async fn main() -> ExitCode {
    jobq_observability::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if commands::is_invalid_input(&err) {
                ExitCode::from(EXIT_INVALID_INPUT)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = Context::open(DataDir::resolve(cli.data_dir)?)?;

    match cli.command {
        Command::Enqueue {
            job,
            priority,
            run_at,
            timeout_secs,
            max_retries,
        } => {
            let overrides = EnqueueOverrides {
                priority,
                run_at,
                timeout_secs,
                max_retries,
            };
            print_json(&commands::enqueue(&ctx, &job, overrides)?)
        }
        Command::Worker {
            command: WorkerCommand::Start { count },
        } => print_json(&commands::worker_start(&ctx, count).await?),
        Command::Status => print_json(&commands::status(&ctx)?),
        Command::List { state } => print_json(&commands::list(&ctx, state.as_deref())?),
        Command::Dlq { command } => match command {
            DlqCommand::List => print_json(&commands::dlq_list(&ctx)?),
            DlqCommand::Retry { job_id } => print_json(&commands::dlq_retry(&ctx, &job_id)?),
        },
        Command::Config { command } => match command {
            ConfigCommand::Set { key, value } => {
                print_json(&commands::config_set(&ctx, &key, &value)?)
            }
            ConfigCommand::Get { key } => print_json(&commands::config_get(&ctx, &key)?),
            ConfigCommand::Show => print_json(&commands::config_show(&ctx)?),
        },
        Command::Logs { job_id } => print_json(&commands::log_paths(&ctx, &job_id)?),
        Command::Web { host, port } => {
            let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                .await
                .with_context(|| format!("failed to bind {host}:{port}"))?;
            tracing::info!(addr = %listener.local_addr()?, "dashboard listening");
            dashboard::serve(listener, commands::dashboard_store(&ctx))
                .await
                .context("dashboard server failed")
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
