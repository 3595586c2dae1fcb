//! Slot lifecycle
//!
//! ```text
//! Empty --claim--> Waiting --select--> Processing --deliver--> Done --fold--> Empty
//!                     |                     |
//!                     +--withdraw/abandon---+--> Error --fold--> Empty
//! ```
//!
//! `Done` and `Error` are transient markers: the releasing party folds them
//! back to `Empty` inside the same critical section, so no other participant
//! ever observes them. Direct `Waiting|Processing -> Empty` is also legal.

use serde::{Deserialize, Serialize};

use crate::error::{ExamError, Result};

/// Grade written into a slot when the exam ends before a real result exists
pub const SENTINEL_GRADE: i32 = -1;

/// Per-slot state as stored in shared memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum SlotState {
    #[default]
    Empty = 0,
    Waiting = 1,
    Processing = 2,
    Done = 3,
    Error = 4,
}

impl SlotState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Empty),
            1 => Some(Self::Waiting),
            2 => Some(Self::Processing),
            3 => Some(Self::Done),
            4 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Awaiting a grade (either queued or being graded)
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Waiting | Self::Processing)
    }

    pub fn can_transition_to(self, to: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, to),
            (Empty, Waiting)
                | (Waiting, Processing)
                | (Waiting, Empty)
                | (Waiting, Error)
                | (Processing, Empty)
                | (Processing, Done)
                | (Processing, Error)
                | (Done, Empty)
                | (Error, Empty)
        )
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Waiting => write!(f, "waiting"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Reject any move not listed in the lifecycle
pub fn check_transition(from: SlotState, to: SlotState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ExamError::InvalidTransition { from, to })
    }
}

/// Why a slot is being handed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// The grade reached the student (folds through `Done`)
    Delivered,
    /// Withdrawn, abandoned, or terminated by shutdown (folds through `Error`)
    Abandoned,
}

impl ReleaseKind {
    pub fn marker(self) -> SlotState {
        match self {
            Self::Delivered => SlotState::Done,
            Self::Abandoned => SlotState::Error,
        }
    }
}

/// Copy of one slot, taken under the table lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub index: usize,
    pub state: SlotState,
    pub owner: u32,
    pub ticket: u32,
    pub grade: i32,
    pub attempt: u64,
    pub grade_channel: String,
    pub ack_channel: String,
}

/// A successful claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claimed {
    pub index: usize,
    pub attempt: u64,
}
