mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { images_dir, ephemeral } => commands::serve(images_dir, ephemeral).await,
        Command::Status => commands::status(cli.remote, cli.token).await,
        Command::Images => commands::images(cli.remote, cli.token).await,
        Command::Runners => commands::runners(cli.remote, cli.token).await,
        Command::Runner { runner_id } => commands::runner(runner_id, cli.remote, cli.token).await,
        Command::Allocate { image_id, user_id, session_minutes } => {
            commands::allocate(image_id, user_id, session_minutes, cli.remote, cli.token).await
        }
        Command::ReportState { runner_id, state } => {
            commands::report_state(runner_id, state, cli.remote, cli.token).await
        }
        Command::ExtendSession { runner_id, additional_minutes } => {
            commands::extend_session(runner_id, additional_minutes, cli.remote, cli.token).await
        }
        Command::Terminate { runner_id } => commands::terminate(runner_id, cli.remote, cli.token).await,
        Command::Reap => commands::reap(cli.remote, cli.token).await,
        Command::ReconcilePools => commands::reconcile_pools(cli.remote, cli.token).await,
        Command::ReclaimIdle => commands::reclaim_idle(cli.remote, cli.token).await,
    }
}
