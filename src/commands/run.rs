use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::{EmitConfig, Settings};
use crate::emitter::RowEmitter;
use crate::pipeline::{Pipeline, PipelineConfig, StartPosition};
use crate::replication::{HttpDiffSource, SequenceNumber};
use crate::tracker::FileStateStore;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// First sequence to process when no state exists (default: upstream latest)
    pub start_sequence: Option<SequenceNumber>,
    /// Append CSV here instead of stdout
    pub output: Option<PathBuf>,
    pub changeset_marker: Option<PathBuf>,
    /// Process at most one available sequence, then return
    pub once: bool,
}

pub async fn run(settings: &Settings, emit: EmitConfig, options: RunOptions) -> Result<()> {
    if emit.is_empty() {
        tracing::warn!(
            "No output categories enabled; diffs will be tracked but produce no rows \
             (enable with --nodes/--ways/--relations/--members/--tags)"
        );
    } else {
        tracing::info!(
            "Emitting categories: {}",
            emit.enabled_categories()
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let source = HttpDiffSource::new(&settings.base_url, settings.request_timeout)?;
    let store = FileStateStore::new(&settings.state_path);
    let output = super::open_output(options.output.as_deref())?;
    let emitter = RowEmitter::new(output, emit);

    let mut config = PipelineConfig::from(settings);
    config.changeset_marker = options.changeset_marker.clone();

    let start = match options.start_sequence {
        Some(sequence) => StartPosition::At(sequence),
        None => StartPosition::Latest,
    };
    let mut pipeline = Pipeline::open(config, source, store, emitter, start).await?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    let summary = pipeline
        .run(shutdown_rx, options.once)
        .await
        .context("Pipeline stopped")?;

    tracing::info!(
        "Processed {} sequences ({} failed cycles): {} records, {} rows; low-water mark {}",
        summary.advanced,
        summary.failures,
        summary.stats.records,
        summary.stats.rows(),
        pipeline.tracker().low_water_mark()
    );
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix (container stop).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                        }
                    }
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
