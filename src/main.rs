use anyhow::Result;
use clap::Parser;
use notewatch::Settings;
use notewatch::cli::commands::{init, run, status, transition};
use notewatch::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before any settings exist
    if let Commands::Init { roots, force } = cli.command {
        notewatch::logging::init();
        return init::run_init(roots, force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow::anyhow!("Configuration error: {e}"))?;

    // The daemon's log file is part of its contract; failing to open it is fatal
    let log_path = match cli.command {
        Commands::Run { .. } => settings.daemon.log_path.as_deref(),
        _ => None,
    };
    notewatch::logging::init_with_config(&settings.logging, log_path)?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Run { roots, poll } => run::run_daemon(settings, roots, poll).await,
        Commands::Status => status::run_status(&settings),
        Commands::Transition { path, to, reason } => {
            transition::run_transition(&settings, &path, to, reason.as_deref()).await
        }
        Commands::Config => {
            init::run_config(&settings);
            Ok(())
        }
    }
}
