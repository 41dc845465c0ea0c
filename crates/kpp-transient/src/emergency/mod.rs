//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Emergency detection, latching safety interlocks and shutdown execution.
//!
//! The responder keeps active emergencies keyed by a monotonically assigned
//! [`EmergencyId`]; ids are never reused, so resolving one event cannot shift
//! the identity of another.

mod interlocks;
mod procedures;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use kpp_common::config::EmergencyConfig;
use kpp_common::time::SimSeconds;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandSet, EmergencyDirectives};
use crate::error::{FaultKind, Result, TransientError};
use crate::history::BoundedHistory;
use crate::metrics::TransientMetrics;
use crate::snapshot::InterlockReadings;

pub use interlocks::{InterlockBank, InterlockKind, LimitViolation, SafetyInterlock};
pub use procedures::{RampBaseline, ShutdownExecution, ShutdownProcedure, ShutdownProgress};

/// Free-form event parameters.
pub type EventParams = IndexMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmergencyId(pub u64);

impl fmt::Display for EmergencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fault domain of an emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    Electrical,
    Mechanical,
    Thermal,
    SafetyViolation,
    Grid,
    Control,
    Environmental,
    Manual,
}

impl EmergencyType {
    pub const ALL: [EmergencyType; 8] = [
        EmergencyType::Electrical,
        EmergencyType::Mechanical,
        EmergencyType::Thermal,
        EmergencyType::SafetyViolation,
        EmergencyType::Grid,
        EmergencyType::Control,
        EmergencyType::Environmental,
        EmergencyType::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyType::Electrical => "electrical",
            EmergencyType::Mechanical => "mechanical",
            EmergencyType::Thermal => "thermal",
            EmergencyType::SafetyViolation => "safety_violation",
            EmergencyType::Grid => "grid",
            EmergencyType::Control => "control",
            EmergencyType::Environmental => "environmental",
            EmergencyType::Manual => "manual",
        }
    }

    /// Post-resolution verification steps for this fault domain.
    fn recovery_checks(&self) -> &'static [&'static str] {
        match self {
            EmergencyType::Electrical => &[
                "verify generator winding insulation",
                "confirm breaker and contactor positions",
            ],
            EmergencyType::Mechanical => &[
                "inspect chain tension and sprocket alignment",
                "verify flywheel bearing temperatures",
            ],
            EmergencyType::Thermal => &[
                "confirm component temperatures below limit",
                "verify cooling flow",
            ],
            EmergencyType::SafetyViolation => &[
                "review tripped interlocks before reset",
                "confirm protective limits restored",
            ],
            EmergencyType::Grid => &[
                "confirm grid voltage and frequency within limits",
                "verify synchronisation check before reconnect",
            ],
            EmergencyType::Control => &[
                "verify controller health and sensor agreement",
                "confirm setpoints restored to configured values",
            ],
            EmergencyType::Environmental => &[
                "confirm site conditions within operating envelope",
            ],
            EmergencyType::Manual => &["operator acknowledgement recorded"],
        }
    }
}

impl fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmergencyType {
    type Err = TransientError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        EmergencyType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| TransientError::UnknownEmergencyType(value.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencySeverity {
    Caution,
    Warning,
    Danger,
    Critical,
}

impl EmergencySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencySeverity::Caution => "caution",
            EmergencySeverity::Warning => "warning",
            EmergencySeverity::Danger => "danger",
            EmergencySeverity::Critical => "critical",
        }
    }

    pub fn requires_shutdown(&self) -> bool {
        *self >= EmergencySeverity::Danger
    }
}

impl fmt::Display for EmergencySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmergencySeverity {
    type Err = TransientError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "caution" => Ok(EmergencySeverity::Caution),
            "warning" => Ok(EmergencySeverity::Warning),
            "danger" => Ok(EmergencySeverity::Danger),
            "critical" => Ok(EmergencySeverity::Critical),
            _ => Err(TransientError::UnknownSeverity(value.to_owned())),
        }
    }
}

/// Aggregate responder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyState {
    Normal,
    Alert,
    Warning,
    Critical,
    Emergency,
    Shutdown,
    Recovery,
}

impl EmergencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyState::Normal => "normal",
            EmergencyState::Alert => "alert",
            EmergencyState::Warning => "warning",
            EmergencyState::Critical => "critical",
            EmergencyState::Emergency => "emergency",
            EmergencyState::Shutdown => "shutdown",
            EmergencyState::Recovery => "recovery",
        }
    }
}

impl From<EmergencySeverity> for EmergencyState {
    fn from(severity: EmergencySeverity) -> Self {
        match severity {
            EmergencySeverity::Caution => EmergencyState::Alert,
            EmergencySeverity::Warning => EmergencyState::Warning,
            EmergencySeverity::Danger => EmergencyState::Critical,
            EmergencySeverity::Critical => EmergencyState::Emergency,
        }
    }
}

impl fmt::Display for EmergencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyEvent {
    pub id: EmergencyId,
    #[serde(rename = "type")]
    pub kind: EmergencyType,
    pub severity: EmergencySeverity,
    pub timestamp: SimSeconds,
    pub message: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: EventParams,
    pub resolved: bool,
    pub resolution_time: Option<SimSeconds>,
    /// Procedure this event started or escalated to, if any.
    pub shutdown: Option<ShutdownProcedure>,
}

impl EmergencyEvent {
    pub fn response_time(&self) -> Option<f64> {
        self.resolution_time
            .map(|resolved| (resolved - self.timestamp).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmAction {
    Tripped,
    Reset,
}

/// Entry in the interlock alarm log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRecord {
    pub at: SimSeconds,
    pub interlock: InterlockKind,
    pub action: AlarmAction,
    pub value: Option<f64>,
    pub limit: f64,
    pub message: String,
}

/// Per-tick responder output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyOutput {
    pub state: EmergencyState,
    pub active_count: usize,
    pub max_severity: Option<EmergencySeverity>,
    pub tripped_interlocks: Vec<InterlockKind>,
    pub newly_tripped: Vec<InterlockKind>,
    pub shutdown: Option<ShutdownProgress>,
    pub directives: EmergencyDirectives,
    pub commands: CommandSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStatus {
    pub state: EmergencyState,
    pub active: Vec<EmergencyEvent>,
    pub total_triggered: u64,
    pub resolved_count: u64,
    pub mean_response_time: f64,
    pub history_len: usize,
    pub interlocks: Vec<SafetyInterlock>,
    pub tripped_interlocks: Vec<InterlockKind>,
    pub shutdown: Option<ShutdownProgress>,
    pub alarm_count: usize,
    pub auto_shutdown: bool,
}

/// Tracks emergencies, interlocks and the running shutdown procedure.
#[derive(Debug)]
pub struct EmergencyResponder {
    config: EmergencyConfig,
    baseline: RampBaseline,
    next_id: u64,
    active: IndexMap<EmergencyId, EmergencyEvent>,
    history: BoundedHistory<EmergencyEvent>,
    interlocks: InterlockBank,
    alarms: BoundedHistory<AlarmRecord>,
    state: EmergencyState,
    shutdown: Option<ShutdownExecution>,
    resolved_count: u64,
    mean_response_time: f64,
    metrics: Option<TransientMetrics>,
}

impl EmergencyResponder {
    pub fn new(config: EmergencyConfig) -> Self {
        let interlocks = InterlockBank::new(config.interlocks.clone());
        let history = BoundedHistory::new(config.history_capacity);
        let alarms = BoundedHistory::new(config.alarm_capacity);
        Self {
            config,
            baseline: RampBaseline::default(),
            next_id: 1,
            active: IndexMap::new(),
            history,
            interlocks,
            alarms,
            state: EmergencyState::Normal,
            shutdown: None,
            resolved_count: 0,
            mean_response_time: 0.0,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<TransientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Operating point gradual shutdowns ramp down from.
    pub fn with_baseline(mut self, baseline: RampBaseline) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn state(&self) -> EmergencyState {
        self.state
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &EmergencyEvent> {
        self.active.values()
    }

    pub fn history(&self) -> &BoundedHistory<EmergencyEvent> {
        &self.history
    }

    pub fn alarms(&self) -> &BoundedHistory<AlarmRecord> {
        &self.alarms
    }

    pub fn interlocks(&self) -> &InterlockBank {
        &self.interlocks
    }

    pub fn tripped_interlocks(&self) -> Vec<InterlockKind> {
        self.interlocks.tripped()
    }

    pub fn shutdown(&self) -> Option<&ShutdownExecution> {
        self.shutdown.as_ref()
    }

    /// True while a plant-stopping procedure is running or held.
    pub fn plant_stopped(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|execution| execution.procedure().stops_plant())
            .unwrap_or(false)
    }

    pub fn mean_response_time(&self) -> f64 {
        self.mean_response_time
    }

    pub fn max_severity(&self) -> Option<EmergencySeverity> {
        self.active.values().map(|event| event.severity).max()
    }

    /// Raise an emergency. Shutdown selection and execution happen before the
    /// event is recorded.
    pub fn trigger(
        &mut self,
        kind: EmergencyType,
        severity: EmergencySeverity,
        message: impl Into<String>,
        parameters: EventParams,
        now: SimSeconds,
    ) -> EmergencyId {
        let message = message.into();
        let id = EmergencyId(self.next_id);
        self.next_id += 1;

        let shutdown = if severity.requires_shutdown() && self.config.auto_shutdown {
            let procedure = ShutdownProcedure::for_emergency(kind);
            self.execute_shutdown(procedure, &message, now);
            Some(procedure)
        } else {
            None
        };

        let event = EmergencyEvent {
            id,
            kind,
            severity,
            timestamp: now,
            message,
            parameters,
            resolved: false,
            resolution_time: None,
            shutdown,
        };
        if severity >= EmergencySeverity::Danger {
            error!(
                target: "kpp::transient::emergency",
                %id,
                kind = %kind,
                %severity,
                fault = %FaultKind::CriticalEmergency,
                message = %event.message,
                "emergency raised"
            );
        } else {
            warn!(
                target: "kpp::transient::emergency",
                %id,
                kind = %kind,
                %severity,
                message = %event.message,
                "emergency raised"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_emergency(kind.as_str(), severity.as_str());
        }
        self.history.push(event.clone());
        self.active.insert(id, event);
        self.recompute_state();
        id
    }

    /// Raise an emergency named by string, as received from an operator
    /// surface.
    pub fn trigger_named(
        &mut self,
        kind: &str,
        severity: EmergencySeverity,
        message: impl Into<String>,
        parameters: EventParams,
        now: SimSeconds,
    ) -> Result<EmergencyId> {
        let kind = kind.parse::<EmergencyType>().map_err(|err| {
            warn!(
                target: "kpp::transient::emergency",
                fault = %FaultKind::UnknownEmergencyType,
                error = %err,
                "emergency rejected"
            );
            err
        })?;
        Ok(self.trigger(kind, severity, message, parameters, now))
    }

    /// Start `procedure`, unless an equal or harder one is already in force.
    /// Returns true when the running procedure changed.
    pub fn execute_shutdown(
        &mut self,
        procedure: ShutdownProcedure,
        reason: &str,
        now: SimSeconds,
    ) -> bool {
        if let Some(current) = &self.shutdown {
            if current.procedure() >= procedure {
                debug!(
                    target: "kpp::transient::emergency",
                    running = %current.procedure(),
                    requested = %procedure,
                    "shutdown request does not escalate"
                );
                return false;
            }
        }
        let previous = self.shutdown.as_ref().map(|execution| execution.procedure());
        error!(
            target: "kpp::transient::emergency",
            %procedure,
            previous = previous.map(|p| p.as_str()).unwrap_or("none"),
            reason,
            "executing shutdown procedure"
        );
        self.shutdown = Some(ShutdownExecution::start(
            procedure,
            &self.config,
            self.baseline,
            reason,
            now,
        ));
        if let Some(metrics) = &self.metrics {
            metrics.record_shutdown(procedure.as_str());
        }
        true
    }

    /// Release a held shutdown after an operator reset.
    pub fn clear_shutdown(&mut self, now: SimSeconds) -> bool {
        match self.shutdown.take() {
            Some(execution) => {
                info!(
                    target: "kpp::transient::emergency",
                    procedure = %execution.procedure(),
                    held_for = now - execution.started_at(),
                    "shutdown cleared"
                );
                self.recompute_state();
                true
            }
            None => false,
        }
    }

    /// Evaluate every interlock. Newly tripped interlocks latch, are logged
    /// to the alarm log and raise a critical safety emergency; interlocks
    /// already tripped stay latched without re-triggering.
    pub fn check_safety_interlocks(
        &mut self,
        readings: &InterlockReadings,
        now: SimSeconds,
    ) -> Vec<InterlockKind> {
        let mut newly_tripped = Vec::new();
        for violation in self.interlocks.evaluate(readings) {
            if !self.interlocks.latch(&violation, now) {
                continue;
            }
            let message = format!(
                "{} interlock tripped: {} exceeds limit {:.2}",
                violation.kind, violation.detail, violation.limit
            );
            error!(
                target: "kpp::transient::emergency",
                interlock = %violation.kind,
                value = violation.value,
                limit = violation.limit,
                fault = %FaultKind::SafetyInterlockTripped,
                "safety interlock tripped"
            );
            self.alarms.push(AlarmRecord {
                at: now,
                interlock: violation.kind,
                action: AlarmAction::Tripped,
                value: Some(violation.value),
                limit: violation.limit,
                message: message.clone(),
            });
            if let Some(metrics) = &self.metrics {
                metrics.record_interlock_trip(violation.kind.as_str());
            }

            let mut parameters = EventParams::new();
            parameters.insert("interlock".into(), Value::from(violation.kind.as_str()));
            parameters.insert("value".into(), Value::from(violation.value));
            parameters.insert("limit".into(), Value::from(violation.limit));
            self.trigger(
                EmergencyType::SafetyViolation,
                EmergencySeverity::Critical,
                message,
                parameters,
                now,
            );
            newly_tripped.push(violation.kind);
        }
        newly_tripped
    }

    /// Clear one interlock latch. Returns true when it had been tripped. A
    /// measurement still out of limits re-trips on the next check.
    pub fn reset_interlock(&mut self, kind: InterlockKind, now: SimSeconds) -> bool {
        if !self.interlocks.reset(kind, now) {
            return false;
        }
        let limit = self.interlocks.limit(kind);
        info!(target: "kpp::transient::emergency", interlock = %kind, "safety interlock reset");
        self.alarms.push(AlarmRecord {
            at: now,
            interlock: kind,
            action: AlarmAction::Reset,
            value: None,
            limit,
            message: format!("{} interlock reset", kind),
        });
        true
    }

    pub fn reset_interlock_by_name(&mut self, name: &str, now: SimSeconds) -> Result<bool> {
        let kind = name.parse::<InterlockKind>()?;
        Ok(self.reset_interlock(kind, now))
    }

    /// Clear every tripped interlock, returning those that were reset.
    pub fn reset_all_interlocks(&mut self, now: SimSeconds) -> Vec<InterlockKind> {
        self.interlocks
            .tripped()
            .into_iter()
            .filter(|kind| self.reset_interlock(*kind, now))
            .collect()
    }

    /// Resolve an active emergency and run its recovery verification.
    pub fn resolve(&mut self, id: EmergencyId, now: SimSeconds) -> Result<EmergencyEvent> {
        let Some(mut event) = self.active.shift_remove(&id) else {
            warn!(target: "kpp::transient::emergency", %id, "resolve requested for unknown emergency");
            return Err(TransientError::UnknownEmergency(id));
        };
        event.resolved = true;
        event.resolution_time = Some(now);
        let response = event.response_time().unwrap_or_default();

        self.resolved_count += 1;
        self.mean_response_time +=
            (response - self.mean_response_time) / self.resolved_count as f64;

        if let Some(recorded) = self.history.iter_mut().rev().find(|entry| entry.id == id) {
            recorded.resolved = true;
            recorded.resolution_time = Some(now);
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_emergency_response(
                event.kind.as_str(),
                Duration::try_from_secs_f64(response).unwrap_or_default(),
            );
        }

        info!(
            target: "kpp::transient::emergency",
            %id,
            kind = %event.kind,
            response_time = response,
            remaining = self.active.len(),
            "emergency resolved"
        );
        self.run_recovery(&event);

        if self.active.is_empty() {
            if let Some(execution) = &self.shutdown {
                if !execution.procedure().stops_plant() {
                    info!(target: "kpp::transient::emergency", "grid isolation released");
                    self.shutdown = None;
                }
            }
        }
        self.recompute_state();
        Ok(event)
    }

    /// Resolve every active emergency in trigger order.
    pub fn resolve_all(&mut self, now: SimSeconds) -> Vec<EmergencyEvent> {
        let ids: Vec<EmergencyId> = self.active.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.resolve(id, now).ok())
            .collect()
    }

    /// Current output for the plant: shutdown commands when a procedure is in
    /// force, otherwise an empty command set.
    pub fn output(&self, newly_tripped: Vec<InterlockKind>, now: SimSeconds) -> EmergencyOutput {
        let (commands, directives, shutdown) = match &self.shutdown {
            Some(execution) => (
                execution.commands(now),
                execution.directives(now),
                Some(execution.progress(now)),
            ),
            None => (CommandSet::default(), EmergencyDirectives::default(), None),
        };
        EmergencyOutput {
            state: self.state,
            active_count: self.active.len(),
            max_severity: self.max_severity(),
            tripped_interlocks: self.interlocks.tripped(),
            newly_tripped,
            shutdown,
            directives,
            commands,
        }
    }

    pub fn status(&self, now: SimSeconds) -> EmergencyStatus {
        EmergencyStatus {
            state: self.state,
            active: self.active.values().cloned().collect(),
            total_triggered: self.next_id - 1,
            resolved_count: self.resolved_count,
            mean_response_time: self.mean_response_time,
            history_len: self.history.len(),
            interlocks: self.interlocks.iter().cloned().collect(),
            tripped_interlocks: self.interlocks.tripped(),
            shutdown: self
                .shutdown
                .as_ref()
                .map(|execution| execution.progress(now)),
            alarm_count: self.alarms.len(),
            auto_shutdown: self.config.auto_shutdown,
        }
    }

    fn run_recovery(&self, event: &EmergencyEvent) {
        for check in event.kind.recovery_checks() {
            info!(
                target: "kpp::transient::emergency",
                id = %event.id,
                kind = %event.kind,
                check,
                "recovery verification"
            );
        }
        let tripped = self.interlocks.tripped();
        if !tripped.is_empty() {
            warn!(
                target: "kpp::transient::emergency",
                id = %event.id,
                tripped = ?tripped,
                "interlocks remain latched after recovery; explicit reset required"
            );
        }
    }

    fn recompute_state(&mut self) {
        let next = match self.max_severity() {
            None => EmergencyState::Normal,
            Some(severity) if self.plant_stopped() => {
                if severity.requires_shutdown() {
                    EmergencyState::Shutdown
                } else {
                    EmergencyState::Recovery
                }
            }
            Some(severity) => severity.into(),
        };
        if next != self.state {
            debug!(
                target: "kpp::transient::emergency",
                from = %self.state,
                to = %next,
                "emergency state changed"
            );
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> EmergencyResponder {
        EmergencyResponder::new(EmergencyConfig::default())
    }

    #[test]
    fn severity_maps_to_aggregate_state() {
        let mut responder = responder();
        responder.trigger(
            EmergencyType::Environmental,
            EmergencySeverity::Caution,
            "high wind",
            EventParams::new(),
            0.0,
        );
        assert_eq!(responder.state(), EmergencyState::Alert);
        responder.trigger(
            EmergencyType::Electrical,
            EmergencySeverity::Warning,
            "current ripple",
            EventParams::new(),
            1.0,
        );
        assert_eq!(responder.state(), EmergencyState::Warning);
        assert!(responder.shutdown().is_none());
    }

    #[test]
    fn danger_runs_domain_procedure_and_only_escalates() {
        let mut responder = responder();
        responder.trigger(
            EmergencyType::Grid,
            EmergencySeverity::Critical,
            "outage",
            EventParams::new(),
            0.0,
        );
        assert_eq!(
            responder.shutdown().map(|s| s.procedure()),
            Some(ShutdownProcedure::Isolation)
        );
        assert_eq!(responder.state(), EmergencyState::Emergency);

        responder.trigger(
            EmergencyType::Mechanical,
            EmergencySeverity::Danger,
            "chain slip",
            EventParams::new(),
            1.0,
        );
        assert_eq!(
            responder.shutdown().map(|s| s.procedure()),
            Some(ShutdownProcedure::Controlled)
        );
        assert_eq!(responder.state(), EmergencyState::Shutdown);

        responder.trigger(
            EmergencyType::Control,
            EmergencySeverity::Danger,
            "setpoint loss",
            EventParams::new(),
            2.0,
        );
        assert_eq!(
            responder.shutdown().map(|s| s.procedure()),
            Some(ShutdownProcedure::Controlled)
        );
    }

    #[test]
    fn auto_shutdown_can_be_disabled() {
        let config = EmergencyConfig {
            auto_shutdown: false,
            ..EmergencyConfig::default()
        };
        let mut responder = EmergencyResponder::new(config);
        let id = responder.trigger(
            EmergencyType::Thermal,
            EmergencySeverity::Critical,
            "stator hot",
            EventParams::new(),
            0.0,
        );
        assert!(responder.shutdown().is_none());
        assert_eq!(responder.active().next().map(|e| e.id), Some(id));
    }

    #[test]
    fn resolve_tracks_cumulative_mean_response_time() {
        let mut responder = responder();
        let first = responder.trigger(
            EmergencyType::Manual,
            EmergencySeverity::Caution,
            "drill",
            EventParams::new(),
            0.0,
        );
        let second = responder.trigger(
            EmergencyType::Manual,
            EmergencySeverity::Caution,
            "drill",
            EventParams::new(),
            0.0,
        );
        responder.resolve(first, 2.0).unwrap();
        responder.resolve(second, 4.0).unwrap();
        assert!((responder.mean_response_time() - 3.0).abs() < 1e-9);
        assert_eq!(responder.state(), EmergencyState::Normal);
        assert!(responder.history().iter().all(|event| event.resolved));

        assert_eq!(
            responder.resolve(first, 5.0),
            Err(TransientError::UnknownEmergency(first))
        );
    }

    #[test]
    fn recovery_state_after_partial_resolution_of_shutdown() {
        let mut responder = responder();
        let critical = responder.trigger(
            EmergencyType::Thermal,
            EmergencySeverity::Critical,
            "stator hot",
            EventParams::new(),
            0.0,
        );
        responder.trigger(
            EmergencyType::Thermal,
            EmergencySeverity::Warning,
            "coolant low",
            EventParams::new(),
            0.5,
        );
        assert_eq!(responder.state(), EmergencyState::Shutdown);
        responder.resolve(critical, 3.0).unwrap();
        assert_eq!(responder.state(), EmergencyState::Recovery);
        responder.resolve_all(4.0);
        assert_eq!(responder.state(), EmergencyState::Normal);
        assert!(responder.plant_stopped());
        assert!(responder.clear_shutdown(5.0));
        assert!(!responder.plant_stopped());
    }

    #[test]
    fn unknown_type_names_are_rejected() {
        let mut responder = responder();
        let err = responder
            .trigger_named(
                "volcanic",
                EmergencySeverity::Danger,
                "?",
                EventParams::new(),
                0.0,
            )
            .unwrap_err();
        assert_eq!(err, TransientError::UnknownEmergencyType("volcanic".into()));
        assert!(!responder.has_active());
        assert!(responder.shutdown().is_none());
    }

    #[test]
    fn interlock_trip_raises_one_emergency_until_reset() {
        let mut responder = responder();
        let readings = InterlockReadings {
            tank_pressure: 12.0,
            grid_voltage: 480.0,
            grid_frequency: 60.0,
            ..InterlockReadings::default()
        };
        assert_eq!(
            responder.check_safety_interlocks(&readings, 1.0),
            vec![InterlockKind::Overpressure]
        );
        assert!(responder.check_safety_interlocks(&readings, 2.0).is_empty());
        assert_eq!(responder.active().count(), 1);
        assert_eq!(responder.alarms().len(), 1);

        assert!(responder.reset_interlock(InterlockKind::Overpressure, 3.0));
        assert_eq!(
            responder.check_safety_interlocks(&readings, 4.0),
            vec![InterlockKind::Overpressure]
        );
        assert_eq!(responder.active().count(), 2);
        assert_eq!(responder.alarms().len(), 3);
    }
}
