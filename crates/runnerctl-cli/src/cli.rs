use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "runnerctl",
    about = "Ephemeral-runner orchestration: allocate, track, and reclaim warm-pooled cloud instances",
    version
)]
pub struct Cli {
    /// Connect to a remote runnerctl server instead of running in-process.
    #[arg(long, env = "RUNNERCTL_URL", global = true)]
    pub remote: Option<String>,

    /// Bearer token for the remote server. Falls back to ~/.runnerctl/token.
    #[arg(long, env = "RUNNERCTL_TOKEN", global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the orchestration server in-process (local only).
    Serve {
        /// Directory of `<image-id>/config.yml` + `scripts/` image definitions.
        #[arg(long, env = "RUNNERCTL_IMAGES_DIR")]
        images_dir: PathBuf,

        /// Use an in-memory store instead of Postgres (DATABASE_URL is ignored).
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show the runner/pool summary.
    Status,

    /// List known images.
    Images,

    /// List runners.
    Runners,

    /// Show one runner.
    Runner { runner_id: String },

    /// Allocate a runner for a user (smoke test / manual allocation).
    Allocate {
        image_id: String,
        user_id: String,
        #[arg(long, default_value_t = 60)]
        session_minutes: i64,
    },

    /// Report an externally observed runner state.
    ReportState { runner_id: String, state: String },

    /// Extend a runner's session window.
    ExtendSession { runner_id: String, additional_minutes: i64 },

    /// Terminate a runner.
    Terminate { runner_id: String },

    /// Manually trigger the expiry reaper sweep.
    Reap,

    /// Manually trigger one pool-controller reconcile pass.
    ReconcilePools,

    /// Manually trigger the idle warm-pool reclaim job.
    ReclaimIdle,
}
