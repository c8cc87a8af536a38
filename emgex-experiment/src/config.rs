use std::fs;
use std::path::{Path, PathBuf};

use emgex_core::{AcquisitionError, Intensity, PhaseKind};
use serde::{Deserialize, Serialize};

/// One entry of a protocol script. A step without intensity is a rest phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStep {
    pub duration_secs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Intensity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl ProtocolStep {
    pub fn rest(duration_secs: u32) -> Self {
        Self {
            duration_secs,
            intensity: None,
            label: None,
        }
    }

    pub fn expression(intensity: Intensity, duration_secs: u32) -> Self {
        Self {
            duration_secs,
            intensity: Some(intensity),
            label: None,
        }
    }

    pub fn kind(&self) -> PhaseKind {
        match self.intensity {
            Some(intensity) => PhaseKind::Expression(intensity),
            None => PhaseKind::Rest,
        }
    }
}

/// Ordered phase script of an experiment variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub name: String,
    pub steps: Vec<ProtocolStep>,
}

impl Protocol {
    pub const PRESETS: [&'static str; 2] = ["standard", "extended"];

    /// Rest / strong / rest / medium / rest / weak / rest, five seconds each.
    pub fn standard() -> Self {
        use Intensity::*;
        Self {
            name: "standard".into(),
            steps: vec![
                ProtocolStep::rest(5),
                ProtocolStep::expression(Strong, 5),
                ProtocolStep::rest(5),
                ProtocolStep::expression(Medium, 5),
                ProtocolStep::rest(5),
                ProtocolStep::expression(Weak, 5),
                ProtocolStep::rest(5),
            ],
        }
    }

    /// Five strong/medium/weak blocks separated by ten-second rests.
    pub fn extended() -> Self {
        use Intensity::*;
        let mut steps = vec![ProtocolStep::rest(5)];
        for block in 0..5 {
            if block > 0 {
                steps.push(ProtocolStep::rest(10));
            }
            steps.extend([
                ProtocolStep::expression(Strong, 5),
                ProtocolStep::rest(5),
                ProtocolStep::expression(Medium, 5),
                ProtocolStep::rest(5),
                ProtocolStep::expression(Weak, 5),
            ]);
        }
        Self {
            name: "extended".into(),
            steps,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "standard" => Some(Self::standard()),
            "extended" => Some(Self::extended()),
            _ => None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, AcquisitionError> {
        serde_json::from_str(text)
            .map_err(|e| AcquisitionError::Config(format!("protocol: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, AcquisitionError> {
        Self::from_json(&read_config_file(path)?)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::standard()
    }
}

/// When markers are published on the low-rate bus channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerMode {
    /// One marker sample alongside every frame.
    #[default]
    PerFrame,
    /// One marker sample at the start of each phase.
    PerPhase,
    Off,
}

/// Row layout of a trial record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordLayout {
    pub decimal_places: usize,
    pub event_column: bool,
    pub index_column: bool,
}

impl Default for RecordLayout {
    fn default() -> Self {
        Self {
            decimal_places: 3,
            event_column: true,
            index_column: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub data_dir: PathBuf,
    /// Countdown shown before every phase.
    pub lead_in_secs: u32,
    /// Frames requested per blocking device read.
    pub frames_per_read: usize,
    pub record: RecordLayout,
    pub marker_mode: MarkerMode,
    /// Display names of conditions A and B.
    pub condition_names: [String; 2],
    pub protocol: Protocol,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("Data"),
            lead_in_secs: 3,
            frames_per_read: 1,
            record: RecordLayout::default(),
            marker_mode: MarkerMode::default(),
            condition_names: ["Smile".into(), "Frown".into()],
            protocol: Protocol::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn from_json(text: &str) -> Result<Self, AcquisitionError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| AcquisitionError::Config(format!("experiment config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AcquisitionError> {
        Self::from_json(&read_config_file(path)?)
    }

    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if self.frames_per_read == 0 {
            return Err(AcquisitionError::Config(
                "frames_per_read must be at least 1".into(),
            ));
        }
        if self.record.decimal_places > 9 {
            return Err(AcquisitionError::Config(
                "decimal_places must not exceed 9".into(),
            ));
        }
        if self.condition_names.iter().any(|n| n.trim().is_empty()) {
            return Err(AcquisitionError::Config(
                "condition names must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn condition_names(&self) -> [&str; 2] {
        [&self.condition_names[0], &self.condition_names[1]]
    }
}

fn read_config_file(path: &Path) -> Result<String, AcquisitionError> {
    fs::read_to_string(path)
        .map_err(|e| AcquisitionError::Config(format!("cannot read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_preset_has_thirty_phases() {
        let protocol = Protocol::extended();
        assert_eq!(protocol.steps.len(), 30);
        let total: u32 = protocol.steps.iter().map(|s| s.duration_secs).sum();
        assert_eq!(total, 170);
        assert_eq!(protocol.steps.iter().filter(|s| s.duration_secs == 10).count(), 4);
    }

    #[test]
    fn standard_preset_alternates_rest_and_expression() {
        let steps = Protocol::standard().steps;
        assert_eq!(steps.len(), 7);
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.intensity.is_none(), i % 2 == 0);
        }
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config = ExperimentConfig::from_json(
            r#"{
                "lead_in_secs": 1,
                "record": { "index_column": true },
                "protocol": {
                    "name": "short",
                    "steps": [
                        { "duration_secs": 2 },
                        { "duration_secs": 3, "intensity": "strong", "label": "Big smile" }
                    ]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.lead_in_secs, 1);
        assert_eq!(config.frames_per_read, 1);
        assert_eq!(config.record.decimal_places, 3);
        assert!(config.record.index_column);
        assert_eq!(config.protocol.steps[1].kind(), PhaseKind::Expression(Intensity::Strong));
        assert_eq!(config.protocol.steps[1].label.as_deref(), Some("Big smile"));
        assert_eq!(config.data_dir, PathBuf::from("Data"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for text in [
            r#"{ "frames_per_read": 0 }"#,
            r#"{ "record": { "decimal_places": 12 } }"#,
            r#"{ "condition_names": ["Smile", " "] }"#,
            r#"{ "lead_in_secs": "three" }"#,
        ] {
            assert!(matches!(
                ExperimentConfig::from_json(text),
                Err(AcquisitionError::Config(_))
            ));
        }
    }

    #[test]
    fn presets_are_looked_up_by_name() {
        assert_eq!(Protocol::preset("Extended"), Some(Protocol::extended()));
        assert_eq!(Protocol::preset("nope"), None);
    }
}
