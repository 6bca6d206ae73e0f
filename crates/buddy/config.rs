//! Queue connection settings for the CLI.
//!
//! Values come from command-line arguments first, then the environment
//! (after loading the project's `.env`), then defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stacks_queue_core::{
    AlwaysLeader, LeaderElection, LockElection, MemoryBackend, RateLimit, SharedBackend,
    WorkerConfig,
};
use stacks_queue_sqlite::SqliteBackend;

use crate::cli::{Cli, WorkArgs};
use crate::error::CommandError;

/// Database path relative to the project, when `DB_DATABASE_PATH` is unset.
pub const DEFAULT_DATABASE_PATH: &str = "database/stacks.sqlite";

/// Storage the commands run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Database { url: String },
    Memory,
}

/// A connected backend and the elector its workers should use.
pub struct Connected {
    pub backend: SharedBackend,
    pub elector: Arc<dyn LeaderElection>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub project: PathBuf,
    pub connection: Connection,
}

impl QueueConfig {
    /// Load `.env` from the project directory, then resolve the connection.
    pub fn load(cli: &Cli) -> Result<Self, CommandError> {
        load_env(&cli.project)?;
        Self::resolve(cli, |key| std::env::var(key).ok())
    }

    /// Resolve settings with `env` as the environment lookup.
    pub fn resolve(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self, CommandError> {
        let name = cli
            .connection
            .clone()
            .or_else(|| env("QUEUE_CONNECTION"))
            .unwrap_or_else(|| "database".to_string());

        let connection = match name.as_str() {
            "database" | "sqlite" => Connection::Database {
                url: database_url(&cli.project, &env),
            },
            "memory" => Connection::Memory,
            other => {
                return Err(CommandError::Config(format!(
                    "unsupported queue connection `{}` (expected `database` or `memory`)",
                    other
                )))
            }
        };

        Ok(Self {
            project: cli.project.clone(),
            connection,
        })
    }

    /// Open the configured storage.
    pub async fn connect(&self, lease: Duration) -> Result<Connected, CommandError> {
        match &self.connection {
            Connection::Database { url } => {
                tracing::debug!(url = %url, "Connecting to queue database");
                create_parent_dir(url)?;
                let backend = SqliteBackend::new(url).await?;
                let elector = LockElection::new(backend.lock(), lease);
                Ok(Connected {
                    backend: SharedBackend::new(backend),
                    elector: Arc::new(elector),
                })
            }
            Connection::Memory => Ok(Connected {
                backend: SharedBackend::new(MemoryBackend::new()),
                elector: Arc::new(AlwaysLeader),
            }),
        }
    }

    /// Worker settings for `queue:work`.
    pub fn worker_config(&self, args: &WorkArgs) -> Result<WorkerConfig, CommandError> {
        let mut builder = WorkerConfig::builder();
        if !args.queue.is_empty() {
            builder = builder.queues(args.queue.iter().map(|q| q.trim().to_string()));
        }
        if let Some(workers) = args.workers {
            builder = builder.num_workers(workers);
        }
        if let Some(sleep) = args.sleep {
            builder = builder.poll_interval(Duration::from_secs(sleep));
        }
        if let Some(timeout) = args.timeout {
            builder = builder.job_timeout(Duration::from_secs(timeout));
        }
        if let Some(max) = args.rate_limit {
            builder = builder.rate_limit(RateLimit::per_minute(max));
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

fn database_url(project: &Path, env: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(url) = env("DATABASE_URL") {
        return url;
    }
    let path = env("DB_DATABASE_PATH").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string());
    let path = Path::new(&path);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        project.join(path)
    };
    format!("sqlite:{}", path.display())
}

/// Create the directory a file-backed SQLite URL points into.
fn create_parent_dir(url: &str) -> Result<(), CommandError> {
    let Some(path) = sqlite_file(url) else {
        return Ok(());
    };
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    std::fs::create_dir_all(parent).map_err(|e| {
        CommandError::Config(format!(
            "cannot create database directory {}: {}",
            parent.display(),
            e
        ))
    })
}

/// File path of a `sqlite:` URL, or `None` for in-memory databases.
fn sqlite_file(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("sqlite:")?;
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Load `<project>/.env` if it exists. Variables already set win.
fn load_env(project: &Path) -> Result<(), CommandError> {
    let path = project.join(".env");
    if !path.exists() {
        return Ok(());
    }
    dotenv::from_path(&path)
        .map_err(|e| CommandError::Config(format!("failed to load {}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), "Loaded environment file");
    Ok(())
}
