use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::AcquisitionError;

/// One of the two mutually exclusive expression conditions of a study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    A,
    B,
}

impl Condition {
    pub const ALL: [Condition; 2] = [Condition::A, Condition::B];

    /// Offset added to the intensity level of expression markers.
    pub fn event_offset(self) -> i32 {
        match self {
            Condition::A => 0,
            Condition::B => 3,
        }
    }

    pub fn letter(self) -> &'static str {
        match self {
            Condition::A => "A",
            Condition::B => "B",
        }
    }

    /// Resolves either the condition letter or one of its display names
    /// (`names[0]` for A, `names[1]` for B), ignoring case.
    pub fn parse_with_names(input: &str, names: [&str; 2]) -> Result<Self, AcquisitionError> {
        let input = input.trim();
        for (condition, name) in Self::ALL.into_iter().zip(names) {
            if input.eq_ignore_ascii_case(condition.letter()) || input.eq_ignore_ascii_case(name) {
                return Ok(condition);
            }
        }
        Err(AcquisitionError::InvalidInput(format!(
            "unknown condition '{input}' (expected A, B, {} or {})",
            names[0], names[1]
        )))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

impl FromStr for Condition {
    type Err = AcquisitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_names(s, ["Smile", "Frown"])
    }
}

/// Identity of one trial record. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialIdentity {
    pub participant: String,
    pub condition: Condition,
    pub sequence: u32,
}

impl TrialIdentity {
    pub fn new(participant: impl Into<String>, condition: Condition, sequence: u32) -> Self {
        Self {
            participant: participant.into(),
            condition,
            sequence,
        }
    }

    /// Common prefix of every record name for this participant and condition.
    pub fn prefix(participant: &str, condition: Condition) -> String {
        format!("{participant}_{condition}_")
    }

    pub fn file_stem(&self) -> String {
        format!(
            "{}{}",
            Self::prefix(&self.participant, self.condition),
            self.sequence
        )
    }
}

impl fmt::Display for TrialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// Lifecycle of an acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    AwaitingDevice,
    Running,
    Stopping,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// States during which the session owns the device and the record.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::AwaitingDevice | SessionState::Running | SessionState::Stopping
        )
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::AwaitingDevice,
            2 => SessionState::Running,
            3 => SessionState::Stopping,
            4 => SessionState::Completed,
            5 => SessionState::Failed,
            _ => SessionState::Idle,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingDevice => "awaiting device",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Lock-free cell holding a [`SessionState`], shared between the console and
/// the session worker.
#[derive(Debug, Default)]
pub struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SessionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}
