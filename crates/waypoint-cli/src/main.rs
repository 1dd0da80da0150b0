//! Waypoint CLI entry point.
//!
//! Binary name: `wp`
//!
//! Parses CLI arguments, opens the workflow database, registers the demo
//! workflows, then dispatches to the appropriate command handler.

mod cli;
mod demo;
mod state;

use clap::Parser;
use waypoint_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,waypoint=debug",
        _ => "trace",
    };
    init_tracing(
        &TracingOptions::new(filter)
            .json(cli.log_json)
            .otel(cli.otel),
    )
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init(cli.data_dir).await?;
    let json = cli.json;

    match cli.command {
        Commands::Workflows => cli::workflow::handle_workflows(&state, json),
        Commands::Run { workflow, input } => {
            cli::workflow::handle_run(&state, &workflow, input.as_deref(), json).await
        }
        Commands::Show { id } => cli::workflow::handle_show(&state, &id, json).await,
        Commands::List { status, limit } => {
            cli::workflow::handle_list(&state, status.as_deref(), limit, json).await
        }
        Commands::Resume { id, checkpoint } => {
            cli::workflow::handle_resume(&state, &id, checkpoint.as_deref(), json).await
        }
        Commands::Recover => cli::workflow::handle_recover(&state, json).await,
        Commands::Approve { id, approver } => {
            cli::approval::handle_approve(&state, &id, &approver, json).await
        }
        Commands::Reject {
            id,
            approver,
            reason,
        } => cli::approval::handle_reject(&state, &id, &approver, &reason, json).await,
        Commands::Expire => cli::approval::handle_expire(&state, json).await,
        Commands::Delete { id, force } => {
            cli::workflow::handle_delete(&state, &id, force, json).await
        }
    }
}
