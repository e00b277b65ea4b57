// ABOUTME: Error taxonomy for the minutely-diff pipeline
// ABOUTME: Separates "wait and retry", "retry now", "reject diff" and fatal failures

use crate::replication::SequenceNumber;
use thiserror::Error;

/// Failures a pipeline cycle can end with.
///
/// Only `OutputWrite` and `State` are fatal. Everything else leaves the
/// low-water mark untouched and the same sequence is attempted again
/// (after a restart, for `Interrupted`).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("diff {sequence} is not published upstream yet")]
    NotAvailable { sequence: SequenceNumber },

    #[error("transient fetch failure for diff {sequence}: {message}")]
    TransientFetch {
        sequence: SequenceNumber,
        message: String,
    },

    #[error("malformed diff {sequence}: {source}")]
    MalformedDiff {
        sequence: SequenceNumber,
        #[source]
        source: DecodeError,
    },

    #[error("shutdown requested while writing rows for diff {sequence}")]
    Interrupted { sequence: SequenceNumber },

    #[error("failed to write output rows: {0}")]
    OutputWrite(#[from] std::io::Error),

    #[error("sequence state error: {0}")]
    State(#[from] TrackerError),
}

impl PipelineError {
    /// Whether the pipeline must halt instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::OutputWrite(_) | PipelineError::State(_))
    }

    pub fn sequence(&self) -> Option<SequenceNumber> {
        match self {
            PipelineError::NotAvailable { sequence }
            | PipelineError::TransientFetch { sequence, .. }
            | PipelineError::MalformedDiff { sequence, .. }
            | PipelineError::Interrupted { sequence } => Some(*sequence),
            PipelineError::OutputWrite(_) | PipelineError::State(_) => None,
        }
    }
}

/// Why a diff payload was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid XML at byte {position}: {message}")]
    Xml { position: usize, message: String },

    #[error("failed to decompress payload: {0}")]
    Compression(String),

    #[error("unexpected root element <{0}>, expected <osmChange>")]
    UnexpectedRoot(String),

    #[error("<{element}> is not allowed inside {context}")]
    UnexpectedElement { element: String, context: String },

    #[error("<{element}> is missing required attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: String },

    #[error("<{element}> has invalid {attribute}='{value}'")]
    InvalidAttribute {
        element: String,
        attribute: String,
        value: String,
    },

    #[error("unexpected text content '{0}'")]
    UnexpectedText(String),

    #[error("document ended before </{0}>")]
    Truncated(String),

    #[error("document has no <osmChange> root")]
    Empty,
}

/// Failures of the sequence tracker and its persistence.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("cannot advance to {attempted}: next expected sequence is {expected}")]
    OutOfOrder {
        expected: SequenceNumber,
        attempted: SequenceNumber,
    },

    #[error("sequence {last} is the last one the replication layout can address")]
    Exhausted { last: SequenceNumber },

    #[error("failed to persist sequence state: {0:#}")]
    Persist(anyhow::Error),
}
