//! CLI command definitions and dispatch for the `parley` binary.
//!
//! Uses clap derive macros for argument parsing. Commands that hand work to
//! the pipeline start the worker pool, and wait for it to drain before they
//! print results.

pub mod ask;
pub mod retry;
pub mod send;
pub mod settings;
pub mod status;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Aggregate chat messages into batches and deliver them reliably.
#[derive(Parser)]
#[command(name = "parley", version, about, long_about = None)]
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

    /// Emit logs in JSON format.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server with the worker pool and stale-batch sweeper.
    Serve {
        /// Address to bind, overriding `bind_address` from config.toml.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Buffer messages into one conversation, flush, and wait for delivery.
    Send {
        /// Message contents, in arrival order.
        #[arg(required = true)]
        messages: Vec<String>,

        /// Continue an existing conversation instead of starting one.
        #[arg(short, long)]
        conversation: Option<Uuid>,
    },

    /// Re-enqueue or time out batches left in flight, and wait for delivery.
    Recover,

    /// Retry failed messages by failure record id.
    Retry {
        /// Failure record ids.
        #[arg(required = true)]
        ids: Vec<Uuid>,

        /// Require the record to belong to this task.
        #[arg(long)]
        task: Option<Uuid>,

        /// Also retry every other failure of the same batch.
        #[arg(long)]
        whole_batch: bool,
    },

    /// Retry every unretried failure of a task.
    #[command(name = "retry-task")]
    RetryTask {
        /// Task id or batch id (`batch_...`).
        target: String,
    },

    /// List failure records.
    Failed {
        /// Include records that were already retried.
        #[arg(long)]
        all: bool,

        /// Only records produced by this task.
        #[arg(long)]
        task: Option<Uuid>,

        /// Maximum rows to show.
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Manage remote service settings.
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },

    /// Ask the remote service directly and stream the reply.
    Ask {
        /// Question to send.
        query: String,

        /// Remote conversation id to continue.
        #[arg(long)]
        remote_conversation: Option<String>,
    },

    /// Pipeline status dashboard.
    Status,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum SettingsCommand {
    /// Register remote service settings.
    Add {
        /// Display name.
        name: String,

        /// Base URL of the chat service (e.g. https://api.example.com/v1).
        #[arg(long)]
        base_url: String,

        /// API key sent as a bearer token.
        #[arg(long, env = "PARLEY_API_KEY", hide_env_values = true)]
        api_key: String,

        /// User identifier sent with every request.
        #[arg(long, default_value = "parley")]
        user: String,

        /// Messages that close a batch.
        #[arg(long)]
        threshold: Option<u32>,

        /// Timeout for one remote call, in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Make these the active settings.
        #[arg(long)]
        activate: bool,
    },

    /// Make a settings row the active one.
    Activate {
        /// Settings id.
        id: Uuid,
    },

    /// List every settings row.
    #[command(alias = "ls")]
    List,

    /// Show the active settings.
    Show,
}

/// Truncate `text` to `max` characters for table cells.
pub(crate) fn preview(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
