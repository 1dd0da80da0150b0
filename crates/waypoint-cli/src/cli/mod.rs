//! CLI command definitions and dispatch for the `wp` binary.
//!
//! Uses clap derive macros for argument parsing. Runs execute inside the
//! `wp` process, so commands that launch or relaunch an instance wait until
//! it completes, fails, or pauses before exiting.

pub mod approval;
pub mod output;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run and operate durable workflows.
#[derive(Parser)]
#[command(name = "wp", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory holding `waypoint.db` and `config.toml`.
    #[arg(long, global = true, env = "WAYPOINT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the registered workflow definitions.
    Workflows,

    /// Start a workflow and wait until it completes, fails, or pauses.
    Run {
        /// Registered workflow name.
        workflow: String,

        /// Initial data as a JSON object.
        #[arg(long)]
        input: Option<String>,
    },

    /// Show a workflow instance.
    Show {
        /// State id.
        id: String,
    },

    /// List workflow instances.
    #[command(alias = "ls")]
    List {
        /// Only instances in this status.
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Resume a paused or interrupted instance.
    Resume {
        /// State id.
        id: String,

        /// Restart from a named checkpoint instead of the recorded step.
        #[arg(long)]
        checkpoint: Option<String>,
    },

    /// Resume every instance left running by a previous process.
    Recover,

    /// Record an approval vote on a paused instance.
    Approve {
        /// State id.
        id: String,

        /// Who is approving.
        #[arg(long)]
        approver: String,
    },

    /// Reject a paused instance, which unwinds its compensations.
    Reject {
        /// State id.
        id: String,

        /// Who is rejecting.
        #[arg(long)]
        approver: String,

        /// Why the request was rejected.
        #[arg(long)]
        reason: String,
    },

    /// Fail every approval whose deadline has passed.
    Expire,

    /// Remove a stored instance.
    #[command(alias = "rm")]
    Delete {
        /// State id.
        id: String,

        /// Also remove instances that have not finished.
        #[arg(long)]
        force: bool,
    },
}
