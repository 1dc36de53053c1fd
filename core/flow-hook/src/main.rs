//! flow-hook: command-line bridge into flowd.
//!
//! Called from file watchers, agent hooks and shell scripts. Results are
//! printed to stdout as JSON; logs go to `<root>/logs/flow-hook.log.*`.
//!
//! ## Subcommands
//!
//! - `emit`: forward one source event read from stdin
//! - `notify`: forward a notify payload built from arguments
//! - `flows`: export, import or validate flow bundles
//! - `session`: start, signal and inspect terminal sessions

mod daemon_client;
mod emit;
mod error;
mod flows;
mod logging;
mod session;

use clap::{Parser, Subcommand};
use flowd_protocol::{SessionSignal, StartSessionParams};
use serde_json::Value;
use std::path::PathBuf;

use error::HookError;

#[derive(Parser)]
#[command(name = "flow-hook")]
#[command(about = "Forward events to flowd and manage its flows and sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a source event (reads JSON from stdin)
    Emit,

    /// Forward a notify event
    Notify {
        /// Event type, e.g. task-complete or plan-new
        #[arg(long = "type", value_name = "TYPE")]
        event_type: String,

        /// Session the event belongs to
        #[arg(long)]
        session: Option<String>,

        /// Extra payload fields
        #[arg(value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },

    /// Manage flow bundles
    Flows {
        #[command(subcommand)]
        command: FlowCommands,
    },

    /// Drive terminal sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand)]
enum FlowCommands {
    /// Print or write the daemon's current flows as a bundle
    Export {
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },

    /// Replace the daemon's flows with a bundle file
    Import {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Check a bundle file without contacting the daemon
    Validate {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Start a session and spawn its terminal
    Start {
        session_id: String,
        #[arg(long)]
        agent: String,
        #[arg(long, default_value = "")]
        l1: String,
        #[arg(long, default_value = "")]
        l2: String,
        #[arg(long)]
        cwd: Option<String>,
    },

    /// Update the session's current task
    Task {
        session_id: String,
        l1: String,
        #[arg(default_value = "")]
        l2: String,
    },

    /// Ring the bell: pause the session for attention
    Bell {
        session_id: String,
        #[arg(long)]
        context: Option<String>,
        /// RFC3339 timestamp; defaults to when the daemon records the signal
        #[arg(long)]
        timestamp: Option<String>,
    },

    /// Resume a paused session (continue, handoff or abort)
    Resume {
        session_id: String,
        #[arg(default_value = "continue")]
        action: String,
    },

    /// Stop a session
    Terminate {
        session_id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Emit a notify event from the session's workflow
    Notify {
        session_id: String,
        #[arg(long = "type")]
        event_type: Option<String>,
        #[arg(long)]
        event_id: Option<String>,
    },

    /// Print the session's current state
    Status { session_id: String },

    /// Print the session's final result
    Result { session_id: String },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(Some(output)) => print_json(&output),
        Ok(None) => {}
        Err(err) => {
            tracing::error!(error = %err, "flow-hook failed");
            eprintln!("flow-hook: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}

fn run(command: Commands) -> Result<Option<Value>, HookError> {
    match command {
        Commands::Emit => emit::run_emit(),
        Commands::Notify {
            event_type,
            session,
            fields,
        } => emit::run_notify(&event_type, session.as_deref(), &fields).map(Some),
        Commands::Flows { command } => {
            let output = match command {
                FlowCommands::Export { out } => flows::export(out.as_deref())?,
                FlowCommands::Import { path } => flows::import(&path)?,
                FlowCommands::Validate { path } => flows::validate(&path)?,
            };
            Ok(Some(output))
        }
        Commands::Session { command } => run_session(command).map(Some),
    }
}

fn run_session(command: SessionCommands) -> Result<Value, HookError> {
    match command {
        SessionCommands::Start {
            session_id,
            agent,
            l1,
            l2,
            cwd,
        } => session::start(StartSessionParams {
            session_id,
            agent_id: agent,
            l1,
            l2,
            cwd,
        }),
        SessionCommands::Task { session_id, l1, l2 } => {
            session::signal(&session_id, SessionSignal::UpdateTask { l1, l2 })
        }
        SessionCommands::Bell {
            session_id,
            context,
            timestamp,
        } => session::signal(&session_id, SessionSignal::Bell { timestamp, context }),
        SessionCommands::Resume { session_id, action } => {
            session::signal(&session_id, SessionSignal::Resume { action })
        }
        SessionCommands::Terminate { session_id, reason } => {
            session::signal(&session_id, SessionSignal::Terminate { reason })
        }
        SessionCommands::Notify {
            session_id,
            event_type,
            event_id,
        } => session::signal(
            &session_id,
            SessionSignal::Notify {
                event_type,
                event_id,
            },
        ),
        SessionCommands::Status { session_id } => session::status(&session_id),
        SessionCommands::Result { session_id } => session::result(&session_id),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(err) => tracing::warn!(error = %err, "Failed to render output"),
    }
}
