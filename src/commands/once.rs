use anyhow::{Context, Result};
use std::path::Path;

use crate::config::{EmitConfig, Settings};
use crate::emitter::RowEmitter;
use crate::pipeline::process_sequence;
use crate::replication::{HttpDiffSource, SequenceNumber};

/// Process one diff to the output without reading or writing sequence state.
///
/// If `changeset_marker` is given, the highest changeset id in the diff
/// (0 when the diff is empty) is written there afterwards.
pub async fn once(
    settings: &Settings,
    emit: EmitConfig,
    sequence: SequenceNumber,
    output: Option<&Path>,
    changeset_marker: Option<&Path>,
) -> Result<()> {
    let source = HttpDiffSource::new(&settings.base_url, settings.request_timeout)?;
    let mut emitter = RowEmitter::new(super::open_output(output)?, emit);

    let stats = process_sequence(&source, sequence, &mut emitter, &settings.retry)
        .await
        .with_context(|| format!("Failed to process sequence {}", sequence))?;

    tracing::info!("Processed sequence {}: {} records", sequence, stats.records);
    for category in emit.enabled_categories() {
        tracing::debug!("Processed {} {}", stats.rows_for(category), category);
    }

    let max_changeset = stats.max_changeset.unwrap_or(0);
    tracing::debug!("max changeset id: {}", max_changeset);
    if let Some(path) = changeset_marker {
        tokio::fs::write(path, max_changeset.to_string())
            .await
            .with_context(|| format!("Failed to write changeset marker {:?}", path))?;
    }
    Ok(())
}
