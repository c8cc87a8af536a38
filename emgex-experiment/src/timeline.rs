use std::time::Duration;

use emgex_core::{AcquisitionError, Condition, PhaseKind, PhaseSpec};

use crate::config::Protocol;

const REST_LABEL: &str = "Relax Face";

/// Fully resolved phase schedule of one trial.
///
/// Labels and event codes are fixed at construction, so the schedule can be
/// inspected before the trial starts. Iterating consumes the timeline; every
/// session builds its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTimeline {
    condition: Condition,
    phases: Vec<PhaseSpec>,
}

impl PhaseTimeline {
    pub fn new(
        protocol: &Protocol,
        condition: Condition,
        condition_names: [&str; 2],
    ) -> Result<Self, AcquisitionError> {
        if protocol.steps.is_empty() {
            return Err(AcquisitionError::Config(format!(
                "protocol '{}' has no phases",
                protocol.name
            )));
        }
        let expression_name = match condition {
            Condition::A => condition_names[0],
            Condition::B => condition_names[1],
        };

        let phases = protocol
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                if step.duration_secs == 0 {
                    return Err(AcquisitionError::Config(format!(
                        "protocol '{}' step {} has zero duration",
                        protocol.name, i
                    )));
                }
                let kind = step.kind();
                let label = match (&step.label, kind) {
                    (Some(label), _) => label.clone(),
                    (None, PhaseKind::Rest) => REST_LABEL.to_string(),
                    (None, PhaseKind::Expression(intensity)) => {
                        format!("{expression_name} {intensity}")
                    }
                };
                Ok(PhaseSpec {
                    label,
                    duration_secs: step.duration_secs,
                    event_code: kind.event_code(condition),
                    kind,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { condition, phases })
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Capture time summed over all phases, excluding lead-ins.
    pub fn total_duration(&self) -> Duration {
        self.phases.iter().map(PhaseSpec::duration).sum()
    }
}

impl IntoIterator for PhaseTimeline {
    type Item = (PhaseSpec, usize);
    type IntoIter = Phases;

    fn into_iter(self) -> Phases {
        Phases {
            remaining: self.phases.len(),
            inner: self.phases.into_iter(),
        }
    }
}

/// Yields each phase with the number of phases still to come after it.
#[derive(Debug)]
pub struct Phases {
    inner: std::vec::IntoIter<PhaseSpec>,
    remaining: usize,
}

impl Iterator for Phases {
    type Item = (PhaseSpec, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let phase = self.inner.next()?;
        self.remaining -= 1;
        Some((phase, self.remaining))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Phases {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolStep;
    use emgex_core::Intensity;

    const NAMES: [&str; 2] = ["Smile", "Frown"];

    #[test]
    fn codes_and_labels_follow_condition() {
        let a = PhaseTimeline::new(&Protocol::standard(), Condition::A, NAMES).unwrap();
        let b = PhaseTimeline::new(&Protocol::standard(), Condition::B, NAMES).unwrap();
        let codes = |t: &PhaseTimeline| t.phases().iter().map(|p| p.event_code).collect::<Vec<_>>();
        assert_eq!(codes(&a), vec![0, 3, 0, 2, 0, 1, 0]);
        assert_eq!(codes(&b), vec![0, 6, 0, 5, 0, 4, 0]);
        assert_eq!(a.phases()[1].label, "Smile Strong");
        assert_eq!(b.phases()[5].label, "Frown Weak");
        assert_eq!(b.phases()[0].label, "Relax Face");
    }

    #[test]
    fn iteration_reports_remaining_phases() {
        let timeline = PhaseTimeline::new(&Protocol::standard(), Condition::A, NAMES).unwrap();
        let remaining: Vec<usize> = timeline.into_iter().map(|(_, r)| r).collect();
        assert_eq!(remaining, vec![6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn total_duration_sums_phases() {
        let timeline = PhaseTimeline::new(&Protocol::extended(), Condition::B, NAMES).unwrap();
        assert_eq!(timeline.len(), 30);
        assert_eq!(timeline.total_duration(), Duration::from_secs(170));
    }

    #[test]
    fn explicit_labels_win() {
        let protocol = Protocol {
            name: "custom".into(),
            steps: vec![ProtocolStep {
                duration_secs: 4,
                intensity: Some(Intensity::Medium),
                label: Some("Half smile".into()),
            }],
        };
        let timeline = PhaseTimeline::new(&protocol, Condition::A, NAMES).unwrap();
        assert_eq!(timeline.phases()[0].label, "Half smile");
        assert_eq!(timeline.phases()[0].event_code, 2);
    }

    #[test]
    fn empty_or_zero_length_protocols_are_rejected() {
        let empty = Protocol {
            name: "empty".into(),
            steps: vec![],
        };
        let zero = Protocol {
            name: "zero".into(),
            steps: vec![ProtocolStep::rest(5), ProtocolStep::rest(0)],
        };
        for protocol in [empty, zero] {
            assert!(matches!(
                PhaseTimeline::new(&protocol, Condition::A, NAMES),
                Err(AcquisitionError::Config(_))
            ));
        }
    }
}
