// ABOUTME: Replication repository addressing for OSM minutely diffs
// ABOUTME: Sequence numbers, AAA/BBB/CCC path layout and state.txt parsing

pub mod source;

pub use source::{fetch_with_retry, DiffSource, FetchError, HttpDiffSource};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default upstream: the planet server's minutely replication stream.
pub const DEFAULT_BASE_URL: &str = "https://planet.openstreetmap.org/replication/minute";

/// Position of a diff in the replication stream.
///
/// The repository layout has room for nine digits, so values never exceed
/// [`SequenceNumber::MAX`]. Untrusted input goes through `TryFrom<u64>` or
/// `FromStr`, which enforce that bound.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u64", into = "u64")]
pub struct SequenceNumber(u64);

/// A sequence number outside the replication layout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("sequence {0} does not fit the nine-digit replication layout (max 999999999)")]
    OutOfRange(u64),
    #[error("invalid sequence number '{0}'")]
    Invalid(String),
}

impl SequenceNumber {
    pub const MAX: SequenceNumber = SequenceNumber(999_999_999);

    /// Wrap a value already known to be at most [`SequenceNumber::MAX`].
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The sequence after this one, or `None` once the layout is exhausted.
    pub fn next(self) -> Option<Self> {
        if self >= Self::MAX {
            None
        } else {
            Some(Self(self.0 + 1))
        }
    }

    /// The sequence before this one, or `None` for sequence 0.
    pub fn prev(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }

    /// Relative path stem of this sequence, e.g. `006/123/456` for 6123456.
    pub fn path_stem(self) -> String {
        let padded = format!("{:09}", self.0);
        format!("{}/{}/{}", &padded[0..3], &padded[3..6], &padded[6..9])
    }

    pub fn diff_url(self, base_url: &str) -> String {
        format!("{}/{}.osc.gz", base_url.trim_end_matches('/'), self.path_stem())
    }

    pub fn state_url(self, base_url: &str) -> String {
        format!(
            "{}/{}.state.txt",
            base_url.trim_end_matches('/'),
            self.path_stem()
        )
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for SequenceNumber {
    type Error = SequenceError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value > Self::MAX.0 {
            return Err(SequenceError::OutOfRange(value));
        }
        Ok(Self(value))
    }
}

impl From<SequenceNumber> for u64 {
    fn from(sequence: SequenceNumber) -> Self {
        sequence.0
    }
}

impl FromStr for SequenceNumber {
    type Err = SequenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u64 = s
            .trim()
            .parse()
            .map_err(|_| SequenceError::Invalid(s.to_string()))?;
        Self::try_from(value)
    }
}

/// URL of the repository-wide `state.txt` describing the newest diff.
pub fn latest_state_url(base_url: &str) -> String {
    format!("{}/state.txt", base_url.trim_end_matches('/'))
}

/// Contents of a replication `state.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationState {
    pub sequence: SequenceNumber,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ReplicationState {
    /// Parse a `state.txt` body (Java properties with `\:` escapes).
    ///
    /// ```
    /// # use osm_minutely::replication::ReplicationState;
    /// let body = "#Sat Oct 17 10:00:02 UTC 2026\nsequenceNumber=6123456\ntimestamp=2026-10-17T09\\:59\\:00Z\n";
    /// let state = ReplicationState::parse(body).unwrap();
    /// assert_eq!(state.sequence.get(), 6123456);
    /// ```
    pub fn parse(body: &str) -> Result<Self> {
        let mut sequence = None;
        let mut timestamp = None;

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().replace("\\:", ":");
            match key.trim() {
                "sequenceNumber" => {
                    let parsed: SequenceNumber = value
                        .parse()
                        .with_context(|| format!("Invalid sequenceNumber '{}'", value))?;
                    sequence = Some(parsed);
                }
                "timestamp" => {
                    let parsed = DateTime::parse_from_rfc3339(&value)
                        .with_context(|| format!("Invalid timestamp '{}'", value))?;
                    timestamp = Some(parsed.with_timezone(&Utc));
                }
                _ => {}
            }
        }

        match sequence {
            Some(sequence) => Ok(Self {
                sequence,
                timestamp,
            }),
            None => bail!("state.txt has no sequenceNumber"),
        }
    }
}
