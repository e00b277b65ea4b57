// ABOUTME: CLI entry point for osm-minutely
// ABOUTME: Parses commands, builds configuration once and routes to handlers

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use osm_minutely::commands::{self, CategoryArgs, RunOptions};
use osm_minutely::config::Settings;
use osm_minutely::tracker::FileStateStore;
use osm_minutely::SequenceNumber;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "osm-minutely")]
#[command(about = "Stream OpenStreetMap minutely diffs as CSV", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Diagnostic logging on stderr (same as --log debug)
    #[arg(long, short = 'v', env = "VERBOSE", global = true, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    verbose: bool,
    /// Path to a TOML config file (defaults to the per-user config if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Where the last processed sequence is persisted
    #[arg(long, env = "OSM_MINUTELY_STATE_FILE", global = true)]
    state_file: Option<PathBuf>,
    /// Replication repository base URL
    #[arg(long, env = "OSM_MINUTELY_BASE_URL", global = true)]
    base_url: Option<String>,
    #[command(flatten)]
    categories: CategoryArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Continuously process diffs after the persisted low-water mark
    Run {
        /// First sequence to process when no state exists (default: upstream latest)
        #[arg(long)]
        start_sequence: Option<SequenceNumber>,
        /// Append CSV to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Write the highest changeset id seen to this file after each diff
        #[arg(long)]
        changeset_marker: Option<PathBuf>,
        /// Process at most one available sequence, then exit
        #[arg(long)]
        once: bool,
    },
    /// Process a single sequence without touching persisted state
    Once {
        /// Sequence number of the diff to process
        sequence: SequenceNumber,
        /// Write the highest changeset id in the diff to this file
        changeset_marker: Option<PathBuf>,
        /// Append CSV to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Inspect or edit the persisted sequence state
    State {
        #[command(flatten)]
        args: commands::state::StateArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --verbose / VERBOSE=1 selects debug
    // 3. --log flag otherwise (default "info")
    let default_filter = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log.clone()
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // stdout carries CSV only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::resolve(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        settings.base_url = base_url;
    }
    if let Some(state_file) = cli.state_file {
        settings.state_path = state_file;
    }
    settings.validate()?;

    let emit = cli.categories.to_emit_config(&settings.categories);

    match cli.command {
        Commands::Run {
            start_sequence,
            output,
            changeset_marker,
            once,
        } => {
            let options = RunOptions {
                start_sequence,
                output,
                changeset_marker,
                once,
            };
            commands::run(&settings, emit, options).await
        }
        Commands::Once {
            sequence,
            changeset_marker,
            output,
        } => {
            commands::once(
                &settings,
                emit,
                sequence,
                output.as_deref(),
                changeset_marker.as_deref(),
            )
            .await
        }
        Commands::State { args } => {
            let store = FileStateStore::new(&settings.state_path);
            commands::state::command(args, &store, &settings.base_url).await
        }
    }
}
