use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::trial::Condition;

/// Instructed effort level of an expression phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Weak,
    Medium,
    Strong,
}

impl Intensity {
    /// Magnitude used in the marker code.
    pub fn level(self) -> i32 {
        match self {
            Intensity::Weak => 1,
            Intensity::Medium => 2,
            Intensity::Strong => 3,
        }
    }

    /// Nominal share of maximum voluntary contraction shown to the participant.
    pub fn effort_percent(self) -> u8 {
        match self {
            Intensity::Weak => 30,
            Intensity::Medium => 60,
            Intensity::Strong => 100,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Intensity::Weak => "Weak",
            Intensity::Medium => "Medium",
            Intensity::Strong => "Strong",
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the participant is asked to do during a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "intensity", rename_all = "lowercase")]
pub enum PhaseKind {
    Rest,
    Expression(Intensity),
}

impl PhaseKind {
    /// Rest is always 0; expressions encode intensity in the magnitude and the
    /// condition as an offset.
    pub fn event_code(self, condition: Condition) -> i32 {
        match self {
            PhaseKind::Rest => 0,
            PhaseKind::Expression(intensity) => intensity.level() + condition.event_offset(),
        }
    }

    pub fn is_rest(self) -> bool {
        matches!(self, PhaseKind::Rest)
    }
}

/// One fully resolved step of a trial schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub label: String,
    pub duration_secs: u32,
    pub event_code: i32,
    pub kind: PhaseKind,
}

impl PhaseSpec {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_secs))
    }

    pub fn is_rest(&self) -> bool {
        self.kind.is_rest()
    }

    /// Prompt text shown while the phase is captured, e.g. `Smile Strong (100%)`.
    pub fn prompt(&self) -> String {
        match self.kind {
            PhaseKind::Rest => format!("{} (Neutral)", self.label),
            PhaseKind::Expression(intensity) => {
                format!("{} ({}%)", self.label, intensity.effort_percent())
            }
        }
    }
}
