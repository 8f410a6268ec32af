//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

use crate::notes::NoteStatus;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Note enrichment daemon
#[derive(Parser)]
#[command(
    name = "notewatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "Watch a notes vault and enrich notes with AI services",
    long_about = "Watches note and screenshot folders, debounces changes and routes them \
                  to enrichment handlers (screenshot import, transcript quotes, smart links).",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Quick Start:\n  $ notewatch init ~/vault       # Write .notewatch/settings.toml\n  $ notewatch run                # Start the daemon (Ctrl-C to stop)\n  $ notewatch status             # Show the last health snapshot"
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true, env = "NW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize project
    #[command(about = "Set up .notewatch directory with default configuration")]
    Init {
        /// Roots to watch
        #[arg(value_name = "ROOT")]
        roots: Vec<PathBuf>,

        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Run the daemon in the foreground
    #[command(about = "Watch roots and enrich notes until interrupted")]
    Run {
        /// Extra roots to watch (added to the configured ones)
        #[arg(value_name = "ROOT")]
        roots: Vec<PathBuf>,

        /// Force the polling watcher
        #[arg(long)]
        poll: bool,
    },

    /// Print the last exported health snapshot
    #[command(about = "Show per-handler and component health as JSON")]
    Status,

    /// Move a note to another lifecycle status
    #[command(
        about = "Change a note's status (inbox, promoted, published, archived)",
        after_help = "Allowed transitions:\n  inbox -> promoted | archived\n  promoted -> published | archived | inbox\n  published -> archived\n  archived -> inbox"
    )]
    Transition {
        /// Note to update
        path: PathBuf,

        /// Target status
        to: NoteStatus,

        /// Reason recorded in the transition history
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings")]
    Config,
}
