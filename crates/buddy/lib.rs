//! # stacks-buddy - Queue commands for Stacks projects
//!
//! `buddy` operates the job queue of a project:
//!
//! - `queue:work` runs a worker pool until Ctrl-C
//! - `queue:clear` deletes pending and reserved jobs (`--force` required)
//! - `queue:flush` deletes failed jobs (`--force` required)
//! - `queue:retry` moves failed jobs back onto their queue
//!
//! Job handlers are compiled in, so a project builds its own worker binary
//! around [`run_main`] with its registry:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let mut registry = JobRegistry::new();
//!     registry.register::<SendWelcomeEmail>();
//!     stacks_buddy::run_main(registry).await
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
mod error;
pub mod logging;

pub use cli::{Cli, Command};
pub use config::{Connection, QueueConfig};
pub use error::CommandError;

use clap::Parser;
use std::process::ExitCode;
use stacks_queue_core::JobRegistry;

/// Parse the process arguments, run the command and report the outcome.
///
/// Exits 0 on success (and for `--help`/`--version`), 1 otherwise.
pub async fn run_main(registry: JobRegistry) -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    logging::init(cli.verbose);

    let result = run(cli, registry).await;
    match &result {
        Ok(message) => println!("{}", message),
        Err(err) => {
            tracing::debug!(error = ?err, "Command failed");
            eprintln!("Error: {}", err);
        }
    }
    ExitCode::from(exit_status(&result))
}

/// Process exit status for a command result.
pub fn exit_status<T>(result: &Result<T, CommandError>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Run one parsed command.
pub async fn run(cli: Cli, registry: JobRegistry) -> Result<String, CommandError> {
    commands::check(&cli.command)?;

    let config = QueueConfig::load(&cli)?;

    let worker_config = match &cli.command {
        Command::Work(args) => Some(config.worker_config(args)?),
        _ => None,
    };
    // leader lease outlives two reaper rounds
    let lease = worker_config
        .as_ref()
        .map(|c| c.reaper_interval * 2)
        .unwrap_or_default();

    let connected = config.connect(lease).await?;
    let backend = connected.backend;

    match cli.command {
        Command::Work(_) => {
            let worker_config = worker_config.unwrap_or_default();
            commands::work(backend, connected.elector, registry, worker_config, async {
                tokio::signal::ctrl_c().await.ok();
            })
            .await
        }
        Command::Clear(args) => commands::clear(&backend, args.queue.as_deref(), args.force).await,
        Command::Flush(args) => {
            commands::flush(&backend, args.queue.as_deref(), args.all, args.force).await
        }
        Command::Retry(args) => commands::retry(&backend, args.id, args.all).await,
    }
}
