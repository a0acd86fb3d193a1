//! Command-line and environment configuration for the runner process.
//!
//! Every flag falls back to an environment variable, so the same binary runs
//! from a shell or from a `.env`-driven container. Tuning knobs that are not
//! listed here (batch size, timeouts, fetch limits) are read by each
//! component's `from_env`.

use clap::{Parser, ValueEnum};

use vibevault_jobs::{defaults, RetryPolicy};

/// How jobs reach this runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Scan the job store for queued jobs on an interval.
    Poll,
    /// Consume job signals from a Redis queue.
    Push,
}

impl Mode {
    /// Retry policy used when none is configured.
    pub fn default_policy(self) -> RetryPolicy {
        match self {
            Mode::Poll => RetryPolicy::poll_default(),
            Mode::Push => RetryPolicy::push_default(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "vibevault-worker")]
#[command(author, version, about = "Fetches page metadata for saved links")]
pub struct Args {
    /// Job delivery mode
    #[arg(long, value_enum, env = "RUNNER_MODE", default_value = "poll")]
    pub mode: Mode,

    /// PostgreSQL connection string
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/vibevault",
        hide_env_values = true
    )]
    pub database_url: String,

    /// Redis connection string (push mode only)
    #[arg(
        long,
        env = "REDIS_URL",
        default_value = defaults::REDIS_URL,
        hide_env_values = true
    )]
    pub redis_url: String,

    /// `fail_fast`, `max_attempts:N` or `max_attempts:N:BASE_MS`
    #[arg(long, env = "RETRY_POLICY")]
    pub retry_policy: Option<RetryPolicy>,

    /// Apply pending migrations before starting
    #[arg(long, env = "RUN_MIGRATIONS")]
    pub migrate: bool,

    /// Do not start the stuck-job reconciler
    #[arg(long, env = "RECONCILER_DISABLED")]
    pub no_reconciler: bool,
}

impl Args {
    pub fn policy(&self) -> RetryPolicy {
        self.retry_policy.unwrap_or_else(|| self.mode.default_policy())
    }
}
