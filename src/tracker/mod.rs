// ABOUTME: Sequence tracker - per-diff state machine over the persisted low-water mark
// ABOUTME: Advances only after every row of a diff has been emitted

pub mod state;

pub use state::{FileStateStore, MemoryStateStore, SequenceState, StateStore};

use std::fmt;

use crate::error::TrackerError;
use crate::replication::SequenceNumber;

/// Where the tracker is within the processing of one diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Fetching(SequenceNumber),
    Decoding(SequenceNumber),
    Emitting(SequenceNumber),
    Advanced(SequenceNumber),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Fetching(seq) => write!(f, "Fetching({})", seq),
            Phase::Decoding(seq) => write!(f, "Decoding({})", seq),
            Phase::Emitting(seq) => write!(f, "Emitting({})", seq),
            Phase::Advanced(seq) => write!(f, "Advanced({})", seq),
        }
    }
}

/// Drives `Idle → Fetching → Decoding → Emitting → Advanced → Idle` for one
/// sequence at a time.
///
/// The tracker owns the in-memory copy of the low-water mark. It is created
/// from a loaded [`SequenceState`] and hands the updated value back through
/// [`SequenceTracker::state`] / [`SequenceTracker::into_state`].
#[derive(Debug)]
pub struct SequenceTracker {
    state: SequenceState,
    phase: Phase,
}

impl SequenceTracker {
    pub fn new(state: SequenceState) -> Self {
        Self {
            state,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    pub fn into_state(self) -> SequenceState {
        self.state
    }

    pub fn low_water_mark(&self) -> SequenceNumber {
        self.state.last_processed
    }

    /// Sequence the next cycle will work on.
    pub fn next_sequence(&self) -> Option<SequenceNumber> {
        self.state.next_sequence()
    }

    pub fn begin_fetch(&mut self) -> Result<SequenceNumber, TrackerError> {
        let sequence = self.next_sequence().ok_or(TrackerError::Exhausted {
            last: self.state.last_processed,
        })?;
        self.transition(Phase::Idle, Phase::Fetching(sequence))?;
        Ok(sequence)
    }

    pub fn begin_decode(&mut self, sequence: SequenceNumber) -> Result<(), TrackerError> {
        self.transition(Phase::Fetching(sequence), Phase::Decoding(sequence))
    }

    pub fn begin_emit(&mut self, sequence: SequenceNumber) -> Result<(), TrackerError> {
        self.transition(Phase::Decoding(sequence), Phase::Emitting(sequence))
    }

    /// Persist `sequence` as the new low-water mark.
    ///
    /// Only legal from `Emitting(sequence)` with `sequence` directly after the
    /// current mark. If the store fails the in-memory mark is left unchanged
    /// and the tracker returns to `Idle`.
    pub async fn commit<S: StateStore + ?Sized>(
        &mut self,
        sequence: SequenceNumber,
        max_changeset: Option<u64>,
        store: &S,
    ) -> Result<(), TrackerError> {
        if self.phase != Phase::Emitting(sequence) {
            return Err(TrackerError::IllegalTransition {
                from: self.phase.to_string(),
                to: Phase::Advanced(sequence).to_string(),
            });
        }
        match self.next_sequence() {
            Some(expected) if expected == sequence => {}
            Some(expected) => {
                self.phase = Phase::Idle;
                return Err(TrackerError::OutOfOrder {
                    expected,
                    attempted: sequence,
                });
            }
            None => {
                self.phase = Phase::Idle;
                return Err(TrackerError::Exhausted {
                    last: self.state.last_processed,
                });
            }
        }

        let mut next_state = self.state.clone();
        next_state.advance(sequence, max_changeset);
        if let Err(e) = store.save(&next_state).await {
            self.phase = Phase::Idle;
            return Err(TrackerError::Persist(e));
        }

        self.state = next_state;
        self.phase = Phase::Advanced(sequence);
        Ok(())
    }

    /// Return to `Idle` after a successful commit.
    pub fn finish(&mut self) -> Result<SequenceNumber, TrackerError> {
        match self.phase {
            Phase::Advanced(sequence) => {
                self.phase = Phase::Idle;
                Ok(sequence)
            }
            other => Err(TrackerError::IllegalTransition {
                from: other.to_string(),
                to: Phase::Idle.to_string(),
            }),
        }
    }

    /// Abandon the in-flight sequence without advancing. The next cycle retries it.
    pub fn fail(&mut self) {
        self.phase = Phase::Idle;
    }

    fn transition(&mut self, from: Phase, to: Phase) -> Result<(), TrackerError> {
        if self.phase != from {
            return Err(TrackerError::IllegalTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }
}
