// ABOUTME: Command implementations for the CLI
// ABOUTME: Exports run, once and state commands plus shared argument groups

pub mod once;
pub mod run;
pub mod state;

pub use once::once;
pub use run::{run, RunOptions};

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use crate::config::{Category, EmitConfig};

/// Output category toggles. Each accepts `1`/`0` (or true/false) from its
/// environment variable, so containers can keep using NODES=1 style flags.
#[derive(Args, Clone, Debug, Default)]
pub struct CategoryArgs {
    /// Emit node rows
    #[arg(long, env = "NODES", global = true, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub nodes: bool,
    /// Emit way rows
    #[arg(long, env = "WAYS", global = true, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub ways: bool,
    /// Emit relation rows
    #[arg(long, env = "RELATIONS", global = true, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub relations: bool,
    /// Emit one row per relation member
    #[arg(long, env = "MEMBERS", global = true, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub members: bool,
    /// Emit one row per tag
    #[arg(long, env = "TAGS", global = true, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub tags: bool,
}

impl CategoryArgs {
    /// Combine CLI/env toggles with categories enabled in the config file.
    pub fn to_emit_config(&self, from_settings: &[Category]) -> EmitConfig {
        let mut config = EmitConfig::new(from_settings);
        for (category, enabled) in [
            (Category::Nodes, self.nodes),
            (Category::Ways, self.ways),
            (Category::Relations, self.relations),
            (Category::Members, self.members),
            (Category::Tags, self.tags),
        ] {
            if enabled {
                config.set(category, true);
            }
        }
        config
    }
}

/// Stdout, or `path` opened for appending.
pub fn open_output(path: Option<&Path>) -> Result<Box<dyn Write + Send>> {
    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open output file {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}
