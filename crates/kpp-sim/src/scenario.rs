//! ---
//! kpp_section: "06-simulation"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Plant model and scenario scripts driving the transient controller."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Timed scenario scripts: plant disturbances and operator actions keyed by
//! simulation time, loaded from JSON.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use kpp_transient::emergency::{EmergencySeverity, InterlockKind};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::plant::PlantInjection;

/// Operator requests a scenario can issue against the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum OperatorAction {
    InitiateStartup,
    AbortStartup {
        #[serde(default = "default_abort_reason")]
        reason: String,
    },
    ManualEmergency {
        severity: EmergencySeverity,
        message: String,
    },
    ResolveAllEmergencies,
    ResetInterlock {
        interlock: InterlockKind,
    },
    ResetInterlocks,
    OperatorReset,
}

fn default_abort_reason() -> String {
    "scenario abort".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioEvent {
    Plant(PlantInjection),
    Operator(OperatorAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Simulation time in seconds at which the event fires.
    pub at: f64,
    #[serde(flatten)]
    pub event: ScenarioEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioScript {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Simulated duration; runs stop here unless told otherwise.
    #[serde(default)]
    pub duration: Option<f64>,
    pub steps: Vec<ScenarioStep>,
}

impl ScenarioScript {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario at {}", path.display()))?;
        let script: Self = contents
            .parse()
            .with_context(|| format!("failed to parse scenario at {}", path.display()))?;
        info!(
            target: "kpp::sim::scenario",
            name = %script.name,
            steps = script.steps.len(),
            path = %path.display(),
            "loaded scenario"
        );
        Ok(script)
    }

    fn validate(&self) -> Result<()> {
        if let Some(step) = self.steps.iter().find(|step| !step.at.is_finite() || step.at < 0.0) {
            return Err(anyhow!("scenario step time {} is invalid", step.at));
        }
        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration <= 0.0 {
                return Err(anyhow!("scenario duration must be positive"));
            }
        }
        Ok(())
    }

    /// Start replaying the script from time zero.
    pub fn cursor(&self) -> ScenarioCursor {
        let mut steps = self.steps.clone();
        steps.sort_by(|a, b| a.at.total_cmp(&b.at));
        ScenarioCursor { steps, next: 0 }
    }
}

impl FromStr for ScenarioScript {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let script: Self = serde_json::from_str(s).context("invalid scenario JSON")?;
        script.validate()?;
        Ok(script)
    }
}

/// Replay position within a script. Steps with equal times fire in file order.
#[derive(Debug, Clone)]
pub struct ScenarioCursor {
    steps: Vec<ScenarioStep>,
    next: usize,
}

impl ScenarioCursor {
    /// Events due at or before `now` that have not fired yet.
    pub fn due(&mut self, now: f64) -> Vec<ScenarioEvent> {
        let start = self.next;
        while self.next < self.steps.len() && self.steps[self.next].at <= now {
            self.next += 1;
        }
        self.steps[start..self.next]
            .iter()
            .map(|step| step.event.clone())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.next >= self.steps.len()
    }

    pub fn remaining(&self) -> usize {
        self.steps.len() - self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAG: &str = r#"{
        "name": "voltage sag",
        "duration": 120,
        "steps": [
            { "at": 95.0, "inject": "grid_restore" },
            { "at": 0.0, "operator": "initiate_startup" },
            { "at": 90, "inject": "grid_voltage", "voltage_v": 430.0 },
            { "at": 100.0, "operator": "manual_emergency", "severity": "warning", "message": "operator check" }
        ]
    }"#;

    #[test]
    fn load_scenario_from_file() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", SAG)?;
        let path = file.into_temp_path();
        let script = ScenarioScript::from_path(&path)?;
        assert_eq!(script.name, "voltage sag");
        assert_eq!(script.duration, Some(120.0));
        assert_eq!(script.steps.len(), 4);
        path.close()?;
        Ok(())
    }

    #[test]
    fn cursor_replays_in_time_order() -> Result<()> {
        let script: ScenarioScript = SAG.parse()?;
        let mut cursor = script.cursor();
        assert_eq!(
            cursor.due(0.0),
            vec![ScenarioEvent::Operator(OperatorAction::InitiateStartup)]
        );
        assert!(cursor.due(50.0).is_empty());
        let due = cursor.due(96.0);
        assert_eq!(
            due,
            vec![
                ScenarioEvent::Plant(PlantInjection::GridVoltage { voltage_v: 430.0 }),
                ScenarioEvent::Plant(PlantInjection::GridRestore),
            ]
        );
        assert_eq!(cursor.remaining(), 1);
        match cursor.due(200.0).as_slice() {
            [ScenarioEvent::Operator(OperatorAction::ManualEmergency { severity, .. })] => {
                assert_eq!(*severity, EmergencySeverity::Warning);
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(cursor.is_finished());
        Ok(())
    }

    #[test]
    fn single_interlock_reset_names_its_interlock() -> Result<()> {
        let script: ScenarioScript = r#"{
            "name": "reset",
            "steps": [{ "at": 5.0, "operator": "reset_interlock", "interlock": "overspeed" }]
        }"#
        .parse()?;
        assert_eq!(
            script.steps[0].event,
            ScenarioEvent::Operator(OperatorAction::ResetInterlock {
                interlock: InterlockKind::Overspeed
            })
        );
        Ok(())
    }

    #[test]
    fn rejects_negative_step_times() {
        let err = r#"{ "name": "bad", "steps": [{ "at": -1.0, "inject": "grid_outage" }] }"#
            .parse::<ScenarioScript>()
            .unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ScenarioScript::from_path(Path::new("/nonexistent/scenario.json")).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/scenario.json"));
    }
}
