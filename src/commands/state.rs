use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::replication::SequenceNumber;
use crate::tracker::{FileStateStore, SequenceState, StateStore};

#[derive(Args)]
pub struct StateArgs {
    #[command(subcommand)]
    command: StateCommands,
}

#[derive(Subcommand)]
enum StateCommands {
    /// Show the last processed sequence
    Get,
    /// Set the last processed sequence (the next run starts after it)
    Set {
        /// Sequence number to record as fully processed
        sequence: SequenceNumber,
    },
    /// Forget the persisted sequence; the next run starts fresh
    Reset,
}

pub async fn command(args: StateArgs, store: &FileStateStore, base_url: &str) -> Result<()> {
    match args.command {
        StateCommands::Get => {
            let state = store.load().await.context("Failed to load state")?;
            match state {
                Some(state) => {
                    println!("Last processed sequence: {}", state.last_processed);
                    match state.next_sequence() {
                        Some(next) => println!("Next sequence: {}", next),
                        None => println!("Next sequence: none (replication layout exhausted)"),
                    }
                    println!("Replication stream: {}", state.base_url);
                    if let Some(changeset) = state.max_changeset {
                        println!("Max changeset id: {}", changeset);
                    }
                    println!("Updated at: {}", state.updated_at.to_rfc3339());
                }
                None => println!("No sequence state recorded in {:?}.", store.path()),
            }
        }
        StateCommands::Set { sequence } => {
            let state = match store.load().await.context("Failed to load state")? {
                Some(mut state) if state.is_for_stream(base_url) => {
                    state.last_processed = sequence;
                    state.updated_at = chrono::Utc::now();
                    state
                }
                _ => SequenceState::new(base_url, sequence),
            };
            store.save(&state).await.context("Failed to save state")?;
            println!("Last processed sequence set to: {}", sequence);
        }
        StateCommands::Reset => {
            store.clear().await.context("Failed to clear state")?;
            println!("Sequence state reset.");
        }
    }
    Ok(())
}
