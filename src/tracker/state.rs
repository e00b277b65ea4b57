// ABOUTME: Persisted low-water mark for the replication stream
// ABOUTME: JSON file store with atomic replace, plus an in-memory store

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

use crate::replication::SequenceNumber;

const STATE_FORMAT_VERSION: u32 = 1;

/// The last fully processed diff of one replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    /// Highest sequence whose rows were all emitted
    pub last_processed: SequenceNumber,
    /// Replication repository the sequence belongs to
    pub base_url: String,
    /// Highest changeset id seen in processed diffs
    #[serde(default)]
    pub max_changeset: Option<u64>,
    /// When the mark last moved
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Version of the state format for future migrations
    pub version: u32,
}

impl SequenceState {
    pub fn new(base_url: &str, last_processed: SequenceNumber) -> Self {
        Self {
            last_processed,
            base_url: base_url.to_string(),
            max_changeset: None,
            updated_at: chrono::Utc::now(),
            version: STATE_FORMAT_VERSION,
        }
    }

    /// State whose next sequence to process is `first`.
    pub fn starting_at(base_url: &str, first: SequenceNumber) -> Result<Self> {
        match first.prev() {
            Some(last) => Ok(Self::new(base_url, last)),
            None => bail!("Cannot start at sequence 0; the first resumable sequence is 1"),
        }
    }

    /// Whether this state was recorded for the stream at `base_url`.
    /// A trailing `/` on either side is ignored.
    pub fn is_for_stream(&self, base_url: &str) -> bool {
        self.base_url.trim_end_matches('/') == base_url.trim_end_matches('/')
    }

    /// `None` once the last sequence the layout can address has been processed.
    pub fn next_sequence(&self) -> Option<SequenceNumber> {
        self.last_processed.next()
    }

    /// Record `sequence` as processed.
    pub fn advance(&mut self, sequence: SequenceNumber, max_changeset: Option<u64>) {
        self.last_processed = sequence;
        self.max_changeset = self.max_changeset.max(max_changeset);
        self.updated_at = chrono::Utc::now();
    }
}

/// Durable home of the low-water mark.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<SequenceState>>;
    async fn save(&self, state: &SequenceState) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// JSON file store. Writes go to a sibling temp file that is renamed over the
/// target, so a crash never leaves a half-written state file behind.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<SequenceState>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read sequence state from {:?}", self.path))
            }
        };
        let state: SequenceState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse sequence state from {:?}", self.path))?;
        if state.version != STATE_FORMAT_VERSION {
            bail!(
                "Unsupported sequence state version {} in {:?} (expected {})",
                state.version,
                self.path,
                STATE_FORMAT_VERSION
            );
        }
        Ok(Some(state))
    }

    async fn save(&self, state: &SequenceState) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(state).context("Failed to serialize sequence state")?;
        let temp_path = self.temp_path();
        fs::write(&temp_path, contents)
            .await
            .with_context(|| format!("Failed to write sequence state to {:?}", temp_path))?;
        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("Failed to move sequence state into {:?}", self.path))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", self.path)),
        }
    }
}

/// Store kept in memory; remembers every saved mark in order.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    current: Mutex<Option<SequenceState>>,
    history: Mutex<Vec<SequenceNumber>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SequenceState) -> Self {
        Self {
            current: Mutex::new(Some(state)),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every `last_processed` value saved so far, oldest first.
    pub fn history(&self) -> Vec<SequenceNumber> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    pub fn current(&self) -> Option<SequenceState> {
        self.current.lock().ok().and_then(|state| state.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<SequenceState>> {
        Ok(self.current())
    }

    async fn save(&self, state: &SequenceState) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        *current = Some(state.clone());
        self.history
            .lock()
            .map_err(|_| anyhow::anyhow!("history lock poisoned"))?
            .push(state.last_processed);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| anyhow::anyhow!("state lock poisoned"))?;
        *current = None;
        Ok(())
    }
}
