//! Maintenance CLI for the relay's durable session store. The chat and
//! runtime adapters live in their own binaries; this one inspects and
//! repairs local state.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use agent_relay_error::RelayError;

use crate::config::RelayConfig;
use crate::store::{JsonFileStore, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay")]
#[command(about = "Chat-thread to coding-agent bridge", version)]
#[command(arg_required_else_help = true)]
pub struct RelayCli {
    #[command(subcommand)]
    command: Command,

    /// Path to the session store file; defaults to the platform data dir.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect and prune durable session records.
    Sessions(SessionsArgs),
    /// Print the effective configuration.
    Config,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(subcommand)]
    command: SessionsCommand,
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// List every thread with a durable record.
    List,
    /// Show one thread's record.
    Show { thread_id: String },
    /// Remove one thread's record.
    Remove { thread_id: String },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Relay(#[from] RelayError),
}

pub fn run_relay() -> Result<(), CliError> {
    let cli = RelayCli::parse();
    crate::telemetry::init_logging();
    run_command(&cli)
}

pub fn run_command(cli: &RelayCli) -> Result<(), CliError> {
    match &cli.command {
        Command::Sessions(args) => run_sessions(&args.command, cli.store.clone()),
        Command::Config => {
            let config = RelayConfig::from_env();
            println!("{config:#?}");
            Ok(())
        }
    }
}

fn run_sessions(command: &SessionsCommand, store_path: Option<PathBuf>) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let store = match store_path {
        Some(path) => JsonFileStore::open(path)?,
        None => JsonFileStore::open_default()?,
    };
    runtime.block_on(async move {
        match command {
            SessionsCommand::List => {
                for (thread_id, record) in store.list().await? {
                    println!(
                        "{thread_id}\t{}\t${:.4}",
                        record.remote_session_id.as_deref().unwrap_or("-"),
                        record.accumulated_cost_usd
                    );
                }
            }
            SessionsCommand::Show { thread_id } => match store.load(thread_id).await? {
                Some(record) => {
                    println!("thread:          {thread_id}");
                    println!(
                        "remote session:  {}",
                        record.remote_session_id.as_deref().unwrap_or("-")
                    );
                    println!(
                        "working dir:     {}",
                        record
                            .working_dir
                            .as_deref()
                            .map(|path| path.display().to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                    println!("cost:            ${:.4}", record.accumulated_cost_usd);
                }
                None => println!("no record for thread {thread_id}"),
            },
            SessionsCommand::Remove { thread_id } => {
                store.remove(thread_id).await?;
                println!("removed {thread_id}");
            }
        }
        Ok(())
    })
}
