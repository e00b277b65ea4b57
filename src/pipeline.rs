// ABOUTME: Minutely pipeline - fetch, decode, emit and commit one sequence at a time
// ABOUTME: Runs cycles continuously until shutdown, pacing itself on the upstream cadence

use anyhow::{bail, Context};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::config::Settings;
use crate::emitter::{EmitStats, RowEmitter};
use crate::error::PipelineError;
use crate::osc::decode_diff;
use crate::replication::{fetch_with_retry, DiffSource, FetchError, SequenceNumber};
use crate::tracker::{SequenceState, SequenceTracker, StateStore};
use crate::utils::{retry_with_backoff, RetryPolicy};

/// Configuration for the Pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Replication repository the sequence numbers refer to
    pub base_url: String,
    /// Wait after the upstream reports the next diff is not published yet
    pub poll_interval: Duration,
    /// Wait after a failed cycle before retrying the same sequence
    pub retry_interval: Duration,
    /// Consecutive failures on one sequence before escalating to error logs
    pub alert_threshold: u32,
    /// Backoff for transient fetch errors within a cycle
    pub retry: RetryPolicy,
    /// File that receives the highest changeset id after each advanced diff
    pub changeset_marker: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for PipelineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            poll_interval: settings.poll_interval,
            retry_interval: settings.retry_interval,
            alert_threshold: settings.alert_threshold,
            retry: settings.retry.clone(),
            changeset_marker: None,
        }
    }
}

/// Where to begin when no state has been persisted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Begin with this sequence
    At(SequenceNumber),
    /// Begin with the newest diff published upstream
    Latest,
}

/// Result of one successful cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub sequence: SequenceNumber,
    pub stats: EmitStats,
    pub payload_bytes: usize,
    pub duration_ms: u64,
}

/// Totals for a `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub cycles: u64,
    pub advanced: u64,
    pub failures: u64,
    /// Failed cycles that reached `alert_threshold` and were logged at error level
    pub alerts: u64,
    pub stats: EmitStats,
    pub last_processed: Option<SequenceNumber>,
}

/// Single logical pipeline over the replication stream.
///
/// Each cycle:
/// 1. Fetches the diff after the low-water mark (retrying transient errors)
/// 2. Decodes it completely, rejecting malformed diffs as a whole
/// 3. Emits rows for enabled categories in decode order
/// 4. Persists the sequence as the new low-water mark
pub struct Pipeline<S, St, W>
where
    S: DiffSource,
    St: StateStore,
    W: Write + Send + 'static,
{
    config: PipelineConfig,
    source: S,
    store: St,
    emitter: RowEmitter<W>,
    tracker: SequenceTracker,
    failing_sequence: Option<SequenceNumber>,
    consecutive_failures: u32,
}

impl<S, St, W> Pipeline<S, St, W>
where
    S: DiffSource,
    St: StateStore,
    W: Write + Send + 'static,
{
    /// Load persisted state (or initialize it from `start`) and build the pipeline.
    pub async fn open(
        config: PipelineConfig,
        source: S,
        store: St,
        emitter: RowEmitter<W>,
        start: StartPosition,
    ) -> anyhow::Result<Self> {
        let state = match store.load().await.context("Failed to load sequence state")? {
            Some(state) => {
                if !state.is_for_stream(&config.base_url) {
                    bail!(
                        "Sequence state belongs to {} but the pipeline is configured for {}. \
                         Reset the state to switch replication streams.",
                        state.base_url,
                        config.base_url
                    );
                }
                if let StartPosition::At(requested) = start {
                    if Some(requested) != state.next_sequence() {
                        tracing::warn!(
                            "Ignoring start sequence {}: resuming after persisted sequence {}",
                            requested,
                            state.last_processed
                        );
                    }
                }
                tracing::info!("Resuming after sequence {}", state.last_processed);
                state
            }
            None => {
                let first = match start {
                    StartPosition::At(sequence) => sequence,
                    StartPosition::Latest => {
                        let latest = retry_with_backoff(
                            &config.retry,
                            || source.latest(),
                            FetchError::is_transient,
                        )
                        .await
                        .context("Failed to read the latest upstream sequence")?;
                        tracing::info!(
                            "No sequence state found; starting at upstream latest {}",
                            latest.sequence
                        );
                        latest.sequence
                    }
                };
                SequenceState::starting_at(&config.base_url, first)?
            }
        };

        Ok(Self {
            config,
            source,
            store,
            emitter,
            tracker: SequenceTracker::new(state),
            failing_sequence: None,
            consecutive_failures: 0,
        })
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn into_parts(self) -> (S, St, RowEmitter<W>, SequenceState) {
        (self.source, self.store, self.emitter, self.tracker.into_state())
    }

    /// Run one cycle for the sequence after the low-water mark.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, PipelineError> {
        let sequence = self.tracker.begin_fetch()?;
        let fetched = fetch_with_retry(&self.source, sequence, &self.config.retry).await;
        self.complete_cycle(sequence, fetched, None).await
    }

    /// Decode, emit and commit a fetched diff.
    ///
    /// With `shutdown`, the output write is raced against it; a shutdown that
    /// wins abandons the sequence with `Interrupted` and nothing is committed.
    async fn complete_cycle(
        &mut self,
        sequence: SequenceNumber,
        fetched: Result<Vec<u8>, FetchError>,
        shutdown: Option<&mut broadcast::Receiver<()>>,
    ) -> Result<CycleReport, PipelineError> {
        let start = Instant::now();

        let payload = match fetched {
            Ok(payload) => payload,
            Err(FetchError::NotAvailable) => {
                self.tracker.fail();
                return Err(PipelineError::NotAvailable { sequence });
            }
            Err(FetchError::Transient(message)) => {
                self.tracker.fail();
                return Err(PipelineError::TransientFetch { sequence, message });
            }
        };

        self.tracker.begin_decode(sequence)?;
        let records = match decode_diff(&payload) {
            Ok(records) => records,
            Err(source) => {
                self.tracker.fail();
                return Err(PipelineError::MalformedDiff { sequence, source });
            }
        };

        self.tracker.begin_emit(sequence)?;
        let (rows, stats) = match self.emitter.render_diff(&records) {
            Ok(rendered) => rendered,
            Err(e) => {
                self.tracker.fail();
                return Err(PipelineError::OutputWrite(e));
            }
        };

        let written = match shutdown {
            Some(shutdown) => tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => None,
                result = self.emitter.write(rows) => Some(result),
            },
            None => Some(self.emitter.write(rows).await),
        };
        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                self.tracker.fail();
                return Err(PipelineError::OutputWrite(e));
            }
            None => {
                self.tracker.fail();
                return Err(PipelineError::Interrupted { sequence });
            }
        }

        self.tracker
            .commit(sequence, stats.max_changeset, &self.store)
            .await?;
        self.tracker.finish()?;
        self.write_changeset_marker().await;

        Ok(CycleReport {
            sequence,
            stats,
            payload_bytes: payload.len(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn write_changeset_marker(&self) {
        let Some(path) = &self.config.changeset_marker else {
            return;
        };
        let value = self.tracker.state().max_changeset.unwrap_or(0);
        if let Err(e) = tokio::fs::write(path, value.to_string()).await {
            tracing::warn!("Failed to write changeset marker {:?}: {}", path, e);
        }
    }

    /// Track repeated failures on the same sequence; returns the count.
    fn note_failure(&mut self, sequence: SequenceNumber) -> u32 {
        if self.failing_sequence == Some(sequence) {
            self.consecutive_failures += 1;
        } else {
            self.failing_sequence = Some(sequence);
            self.consecutive_failures = 1;
        }
        self.consecutive_failures
    }

    fn clear_failures(&mut self) {
        self.failing_sequence = None;
        self.consecutive_failures = 0;
    }

    /// Run cycles until shutdown, or until nothing is left to do when `once` is set.
    ///
    /// Fetch waits and pacing sleeps are raced against `shutdown`; emission and
    /// commit of a fetched diff are not interrupted. A sequence abandoned by
    /// shutdown is retried on the next start.
    pub async fn run(
        &mut self,
        mut shutdown: broadcast::Receiver<()>,
        once: bool,
    ) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();

        tracing::info!(
            "Starting pipeline after sequence {} with poll_interval={:?}, retry_interval={:?}",
            self.tracker.low_water_mark(),
            self.config.poll_interval,
            self.config.retry_interval
        );

        loop {
            let sequence = self.tracker.begin_fetch()?;
            let fetched = tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    self.tracker.fail();
                    tracing::info!(
                        "Shutdown signal received while fetching {}, stopping pipeline",
                        sequence
                    );
                    break;
                }
                fetched = fetch_with_retry(&self.source, sequence, &self.config.retry) => fetched,
            };

            summary.cycles += 1;
            let delay = match self.complete_cycle(sequence, fetched, Some(&mut shutdown)).await {
                Ok(report) => {
                    self.clear_failures();
                    summary.advanced += 1;
                    summary.stats.merge(&report.stats);
                    summary.last_processed = Some(report.sequence);
                    tracing::info!(
                        "Sequence {} processed: {} records, {} rows ({} bytes) in {}ms",
                        report.sequence,
                        report.stats.records,
                        report.stats.rows(),
                        report.payload_bytes,
                        report.duration_ms
                    );
                    None
                }
                Err(PipelineError::NotAvailable { sequence }) => {
                    tracing::debug!(
                        "Sequence {} not published yet, waiting {:?}",
                        sequence,
                        self.config.poll_interval
                    );
                    if once {
                        break;
                    }
                    Some(self.config.poll_interval)
                }
                Err(PipelineError::Interrupted { sequence }) => {
                    tracing::info!(
                        "Shutdown signal received while writing rows for {}, stopping pipeline",
                        sequence
                    );
                    break;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Pipeline halted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    summary.failures += 1;
                    let sequence = e.sequence().unwrap_or(sequence);
                    let failures = self.note_failure(sequence);
                    if failures >= self.config.alert_threshold {
                        summary.alerts += 1;
                        match &e {
                            PipelineError::MalformedDiff { .. } => tracing::error!(
                                "Sequence {} rejected {} times in a row; upstream or format problem needs operator attention: {}",
                                sequence,
                                failures,
                                e
                            ),
                            _ => tracing::error!(
                                "Sustained fetch failures for sequence {} ({} cycles): {}",
                                sequence,
                                failures,
                                e
                            ),
                        }
                    } else {
                        tracing::warn!("Cycle for sequence {} failed (attempt {}): {}", sequence, failures, e);
                    }
                    if once {
                        return Err(e);
                    }
                    Some(self.config.retry_interval)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        tracing::info!("Shutdown signal received, stopping pipeline");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else if once {
                break;
            }
        }

        Ok(summary)
    }
}

/// Fetch, decode and emit a single sequence without touching persisted state.
pub async fn process_sequence<S, W>(
    source: &S,
    sequence: SequenceNumber,
    emitter: &mut RowEmitter<W>,
    retry: &RetryPolicy,
) -> Result<EmitStats, PipelineError>
where
    S: DiffSource + ?Sized,
    W: Write + Send + 'static,
{
    let payload = fetch_with_retry(source, sequence, retry)
        .await
        .map_err(|e| match e {
            FetchError::NotAvailable => PipelineError::NotAvailable { sequence },
            FetchError::Transient(message) => PipelineError::TransientFetch { sequence, message },
        })?;
    let records =
        decode_diff(&payload).map_err(|source| PipelineError::MalformedDiff { sequence, source })?;
    Ok(emitter.emit_diff(&records).await?)
}
