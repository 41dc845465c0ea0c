//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Root coordinator. Owns the three leaf handlers, calls them in a fixed
//! order every tick, escalates their faults and arbitrates which one drives
//! the plant. The controller is the only writer of [`SystemState`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use kpp_common::config::{ControllerConfig, TransientConfig};
use kpp_common::time::{elapsed, SimSeconds};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::commands::{CommandSet, EmergencyDirectives};
use crate::emergency::{
    EmergencyEvent, EmergencyId, EmergencyOutput, EmergencyResponder, EmergencySeverity,
    EmergencyStatus, EmergencyType, EventParams, InterlockKind, RampBaseline,
};
use crate::error::{FaultKind, Result, TransientError};
use crate::grid::{GridDisturbanceHandler, GridResponse, GridStatus};
use crate::history::BoundedHistory;
use crate::metrics::TransientMetrics;
use crate::snapshot::SystemSnapshot;
use crate::startup::{StartupOutput, StartupPhase, StartupSequencer, StartupStatus};

/// Plant-level operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Offline,
    Starting,
    Operational,
    EmergencyActive,
    Shutdown,
    Recovering,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Offline => "offline",
            SystemState::Starting => "starting",
            SystemState::Operational => "operational",
            SystemState::EmergencyActive => "emergency_active",
            SystemState::Shutdown => "shutdown",
            SystemState::Recovering => "recovering",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which leaf drove the plant on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryEventType {
    None,
    Startup,
    Emergency,
    GridSupport,
}

impl PrimaryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryEventType::None => "none",
            PrimaryEventType::Startup => "startup",
            PrimaryEventType::Emergency => "emergency",
            PrimaryEventType::GridSupport => "grid_support",
        }
    }
}

impl fmt::Display for PrimaryEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: SystemState,
    pub to: SystemState,
    pub at: SimSeconds,
    pub reason: String,
}

/// Everything the controller decided on one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatedCommands {
    pub time: SimSeconds,
    pub primary_event_type: PrimaryEventType,
    pub system_state: SystemState,
    /// Merged commands that drive the plant.
    pub commands: CommandSet,
    pub startup_commands: CommandSet,
    pub emergency_commands: CommandSet,
    pub grid_commands: CommandSet,
    /// Grid commands were computed but not applied this tick.
    pub grid_commands_informational: bool,
    pub emergency_directives: EmergencyDirectives,
    pub startup: StartupOutput,
    pub emergency: EmergencyOutput,
    pub grid: GridResponse,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub handler_faults: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub system_state: SystemState,
    pub primary_event_type: PrimaryEventType,
    pub pre_emergency_state: SystemState,
    pub ticks: u64,
    pub last_update: Option<SimSeconds>,
    pub handler_faults: u64,
    pub startup: StartupStatus,
    pub emergency: EmergencyStatus,
    pub grid: GridStatus,
    pub transitions: Vec<StateTransition>,
}

/// Supervises startup, emergencies and grid disturbances as one state
/// machine.
#[derive(Debug)]
pub struct TransientEventController {
    config: ControllerConfig,
    startup: StartupSequencer,
    emergency: EmergencyResponder,
    grid: GridDisturbanceHandler,
    state: SystemState,
    pre_emergency: SystemState,
    primary: PrimaryEventType,
    transitions: BoundedHistory<StateTransition>,
    last_escalated_grid_fault: Option<u64>,
    snapshot_invalid: bool,
    recovering_since: Option<SimSeconds>,
    last_update: Option<SimSeconds>,
    ticks: u64,
    handler_faults: u64,
    metrics: Option<TransientMetrics>,
}

impl TransientEventController {
    /// Build the coordinator. Leaf nominals are taken from `config.plant`.
    pub fn new(mut config: TransientConfig, metrics: Option<TransientMetrics>) -> Self {
        config.apply_plant_nominal();
        let TransientConfig {
            plant: _,
            startup,
            emergency,
            grid,
            controller,
        } = config;
        let baseline = RampBaseline {
            pressure_bar: controller.operational_pressure_bar,
            injection_frequency_hz: controller.operational_injection_frequency_hz,
            speed_rpm: controller.operational_speed_rpm,
        };
        let transitions = BoundedHistory::new(controller.transition_history_capacity);
        Self {
            startup: StartupSequencer::new(startup).with_metrics(metrics.clone()),
            emergency: EmergencyResponder::new(emergency)
                .with_baseline(baseline)
                .with_metrics(metrics.clone()),
            grid: GridDisturbanceHandler::new(grid).with_metrics(metrics.clone()),
            config: controller,
            state: SystemState::Offline,
            pre_emergency: SystemState::Offline,
            primary: PrimaryEventType::None,
            transitions,
            last_escalated_grid_fault: None,
            snapshot_invalid: false,
            recovering_since: None,
            last_update: None,
            ticks: 0,
            handler_faults: 0,
            metrics,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn primary_event_type(&self) -> PrimaryEventType {
        self.primary
    }

    pub fn startup(&self) -> &StartupSequencer {
        &self.startup
    }

    pub fn emergency(&self) -> &EmergencyResponder {
        &self.emergency
    }

    pub fn grid(&self) -> &GridDisturbanceHandler {
        &self.grid
    }

    pub fn transitions(&self) -> &BoundedHistory<StateTransition> {
        &self.transitions
    }

    /// Run one coordination tick against `snapshot`.
    pub fn update(&mut self, snapshot: &SystemSnapshot, now: SimSeconds) -> CoordinatedCommands {
        self.ticks += 1;
        self.last_update = Some(now);
        let mut faults: Vec<TransientError> = Vec::new();

        let valid = match snapshot.validate() {
            Ok(()) => {
                self.snapshot_invalid = false;
                true
            }
            Err(err) => {
                warn!(target: "kpp::transient::controller", error = %err, "snapshot rejected");
                if !self.snapshot_invalid {
                    faults.push(err);
                }
                self.snapshot_invalid = true;
                false
            }
        };

        // Leaves run in fixed order: startup, emergency, grid.
        let startup_was_active = self.startup.is_active();
        let inputs = snapshot.startup_inputs();
        let mut startup_out = match guarded("startup", || self.startup.update(&inputs, now)) {
            Ok(output) => output,
            Err(err) => {
                self.startup.fail_with_handler_fault(&err.to_string(), now);
                faults.push(err);
                self.startup.current_output(now)
            }
        };

        let newly_tripped = if valid {
            let readings = snapshot.interlock_readings();
            match guarded("emergency", || {
                self.emergency.check_safety_interlocks(&readings, now)
            }) {
                Ok(tripped) => tripped,
                Err(err) => {
                    faults.push(err);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let measurement = snapshot.grid_measurement();
        let grid_response = match guarded("grid", || {
            if valid {
                self.grid.monitor(&measurement, now);
            }
            self.grid.execute_response(now)
        }) {
            Ok(response) => response,
            Err(err) => {
                faults.push(err);
                GridResponse::idle()
            }
        };

        let handler_faults = self.escalate_handler_faults(faults, now);
        self.escalate_startup_failure(&startup_out, now);
        self.escalate_grid_fault(&grid_response, now);
        self.reconcile(now);

        // A plant-stopping shutdown may have aborted the sequence after it ran.
        if startup_was_active
            && !startup_out.startup_failed
            && self.startup.phase() == StartupPhase::Failed
        {
            startup_out = self.startup.current_output(now);
            startup_out.newly_failed = true;
        }

        let emergency_out = self.emergency.output(newly_tripped, now);
        self.arbitrate(startup_out, emergency_out, grid_response, handler_faults, now)
    }

    fn arbitrate(
        &mut self,
        startup: StartupOutput,
        emergency: EmergencyOutput,
        grid: GridResponse,
        handler_faults: Vec<String>,
        now: SimSeconds,
    ) -> CoordinatedCommands {
        let primary = if self.emergency.has_active() {
            PrimaryEventType::Emergency
        } else if self.startup.is_active() {
            PrimaryEventType::Startup
        } else if grid.active_count > 0 && self.state == SystemState::Operational {
            PrimaryEventType::GridSupport
        } else {
            PrimaryEventType::None
        };
        self.primary = primary;

        let mut commands = self.base_commands(&startup);
        if primary == PrimaryEventType::GridSupport {
            commands.overlay(&grid.commands);
        }
        let mut directives = emergency.directives;
        if let Some(startup_directives) = startup.emergency_commands {
            commands.overlay(&startup_directives.to_command_set());
            directives = directives.merge(startup_directives);
        }
        commands.overlay(&emergency.commands);

        CoordinatedCommands {
            time: now,
            primary_event_type: primary,
            system_state: self.state,
            commands,
            startup_commands: startup.commands.clone(),
            emergency_commands: emergency.commands.clone(),
            grid_commands: grid.commands.clone(),
            grid_commands_informational: grid.active_count > 0
                && primary != PrimaryEventType::GridSupport,
            emergency_directives: directives,
            startup,
            emergency,
            grid,
            handler_faults,
        }
    }

    /// Commands for the current state before any transient overlays.
    ///
    /// While an emergency is active the sequencer no longer drives the plant:
    /// a running plant holds its operating point, anything else idles.
    fn base_commands(&self, startup: &StartupOutput) -> CommandSet {
        match self.state {
            SystemState::EmergencyActive => match self.pre_emergency {
                SystemState::Operational => self.operational_commands(),
                SystemState::Shutdown => CommandSet::safe_stop(),
                _ => CommandSet::idle_hold(),
            },
            SystemState::Starting if self.startup.is_active() => startup.commands.clone(),
            SystemState::Operational => self.operational_commands(),
            SystemState::Shutdown => CommandSet::safe_stop(),
            _ => CommandSet::idle_hold(),
        }
    }

    /// Normal running commands at the configured operating point.
    pub fn operational_commands(&self) -> CommandSet {
        let mut commands = CommandSet::default();
        commands.pneumatic.compressor_enabled = Some(true);
        commands.pneumatic.injection_enabled = Some(true);
        commands.pneumatic.vent_valves_open = Some(false);
        commands.pneumatic.pressure_setpoint = Some(self.config.operational_pressure_bar);
        commands.pneumatic.injection_frequency =
            Some(self.config.operational_injection_frequency_hz);
        commands.electrical.generator_enable = Some(true);
        commands.electrical.grid_connect = Some(true);
        commands.electrical.load_factor = Some(1.0);
        commands.mechanical.mechanical_brake = Some(false);
        commands.control.speed_setpoint = Some(self.config.operational_speed_rpm);
        commands.control.islanded_mode = Some(false);
        commands
    }

    fn escalate_handler_faults(&mut self, faults: Vec<TransientError>, now: SimSeconds) -> Vec<String> {
        let mut reported = Vec::with_capacity(faults.len());
        for fault in faults {
            let component = match &fault {
                TransientError::HandlerFault { component, .. } => *component,
                _ => "snapshot",
            };
            self.handler_faults += 1;
            error!(
                target: "kpp::transient::controller",
                component,
                error = %fault,
                fault = %FaultKind::HandlerFault,
                "leaf handler fault contained"
            );
            let mut parameters = EventParams::new();
            parameters.insert("component".into(), Value::from(component));
            self.emergency.trigger(
                EmergencyType::Control,
                EmergencySeverity::Danger,
                fault.to_string(),
                parameters,
                now,
            );
            reported.push(fault.to_string());
        }
        reported
    }

    fn escalate_startup_failure(&mut self, startup: &StartupOutput, now: SimSeconds) {
        if !startup.newly_failed {
            return;
        }
        let Some(kind) = startup.failure_kind else {
            return;
        };
        if matches!(kind, FaultKind::Aborted | FaultKind::HandlerFault) {
            return;
        }
        let reason = startup
            .failure_reason
            .clone()
            .unwrap_or_else(|| kind.to_string());
        let mut parameters = EventParams::new();
        parameters.insert("fault".into(), Value::from(kind.as_str()));
        parameters.insert("phase".into(), Value::from(startup.current_phase.as_str()));
        self.emergency.trigger(
            EmergencyType::Control,
            EmergencySeverity::Danger,
            format!("startup failed: {}", reason),
            parameters,
            now,
        );
    }

    fn escalate_grid_fault(&mut self, response: &GridResponse, now: SimSeconds) {
        if !response.disconnect_required {
            return;
        }
        let Some(event) = response.disconnect_event else {
            return;
        };
        if self.last_escalated_grid_fault == Some(event) {
            return;
        }
        self.last_escalated_grid_fault = Some(event);
        let mut parameters = EventParams::new();
        parameters.insert("disturbance".into(), Value::from(event));
        self.emergency.trigger(
            EmergencyType::Grid,
            EmergencySeverity::Critical,
            "grid fault requires disconnection",
            parameters,
            now,
        );
    }

    /// Bring `SystemState` in line with the leaves.
    ///
    /// Clearing the last emergency restores the pre-emergency state, with one
    /// exception: if a plant-stopping procedure ran, the plant is stopped and
    /// the state becomes `Shutdown` until `operator_reset`.
    fn reconcile(&mut self, now: SimSeconds) {
        if self.emergency.plant_stopped() && self.startup.is_active() {
            self.startup
                .abort("plant-stopping shutdown in progress", now);
        }

        if self.emergency.has_active() {
            if self.state != SystemState::EmergencyActive {
                let reason = self
                    .emergency
                    .active()
                    .last()
                    .map(|event| format!("{} emergency: {}", event.kind, event.message))
                    .unwrap_or_else(|| "emergency active".into());
                self.pre_emergency = self.state;
                self.transition(SystemState::EmergencyActive, reason, now);
            }
            return;
        }

        let (next, reason) = match self.state {
            SystemState::EmergencyActive if self.emergency.plant_stopped() => (
                SystemState::Shutdown,
                "emergencies resolved; shutdown held".to_string(),
            ),
            SystemState::EmergencyActive => (
                self.resume_state(),
                "emergencies resolved".to_string(),
            ),
            SystemState::Starting if !self.startup.is_active() => {
                if self.startup.phase() == StartupPhase::Operational {
                    (SystemState::Operational, "startup complete".to_string())
                } else {
                    (SystemState::Shutdown, "startup ended without completing".to_string())
                }
            }
            SystemState::Recovering => {
                let dwell_done = self
                    .recovering_since
                    .map(|since| elapsed(since, now) >= self.config.recovery_dwell)
                    .unwrap_or(true);
                if dwell_done {
                    (SystemState::Offline, "recovery dwell elapsed".to_string())
                } else {
                    (SystemState::Recovering, String::new())
                }
            }
            other => (other, String::new()),
        };
        self.transition(next, reason, now);
    }

    /// State to return to when the last emergency clears without a
    /// plant-stopping shutdown.
    fn resume_state(&self) -> SystemState {
        if self.startup.is_active() {
            return SystemState::Starting;
        }
        match self.pre_emergency {
            SystemState::Starting if self.startup.phase() == StartupPhase::Operational => {
                SystemState::Operational
            }
            SystemState::Starting => SystemState::Shutdown,
            other => other,
        }
    }

    fn transition(&mut self, to: SystemState, reason: impl Into<String>, now: SimSeconds) {
        if self.state == to {
            return;
        }
        let from = self.state;
        let reason = reason.into();
        info!(
            target: "kpp::transient::controller",
            %from,
            %to,
            reason = %reason,
            now,
            "system state transition"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(from.as_str(), to.as_str());
        }
        self.recovering_since = (to == SystemState::Recovering).then_some(now);
        self.transitions.push(StateTransition {
            from,
            to,
            at: now,
            reason,
        });
        self.state = to;
    }

    /// Begin a startup. Permitted only from `Offline` or `Operational` with
    /// no interlock tripped.
    pub fn initiate_startup(&mut self, now: SimSeconds) -> Result<()> {
        if !matches!(self.state, SystemState::Offline | SystemState::Operational) {
            return Err(TransientError::StartupNotPermitted(self.state));
        }
        let tripped = self.emergency.tripped_interlocks();
        if !tripped.is_empty() {
            return Err(TransientError::InterlocksTripped(tripped));
        }
        self.startup.initiate(now)?;
        self.transition(SystemState::Starting, "startup initiated", now);
        Ok(())
    }

    /// Abort a running startup. Returns false when none was running.
    pub fn abort_startup(&mut self, reason: &str, now: SimSeconds) -> bool {
        if !self.startup.abort(reason, now) {
            return false;
        }
        if self.state == SystemState::Starting {
            self.transition(
                SystemState::Shutdown,
                format!("startup aborted: {}", reason),
                now,
            );
        }
        self.reconcile(now);
        true
    }

    pub fn trigger_manual_emergency(
        &mut self,
        severity: EmergencySeverity,
        message: &str,
        now: SimSeconds,
    ) -> EmergencyId {
        self.trigger_emergency(EmergencyType::Manual, severity, message, EventParams::new(), now)
    }

    pub fn trigger_emergency(
        &mut self,
        kind: EmergencyType,
        severity: EmergencySeverity,
        message: &str,
        parameters: EventParams,
        now: SimSeconds,
    ) -> EmergencyId {
        let id = self
            .emergency
            .trigger(kind, severity, message, parameters, now);
        self.reconcile(now);
        id
    }

    pub fn resolve_emergency(&mut self, id: EmergencyId, now: SimSeconds) -> Result<EmergencyEvent> {
        let resolved = self.emergency.resolve(id, now);
        self.reconcile(now);
        resolved
    }

    pub fn resolve_all_emergencies(&mut self, now: SimSeconds) -> Vec<EmergencyEvent> {
        let resolved = self.emergency.resolve_all(now);
        self.reconcile(now);
        resolved
    }

    pub fn reset_interlock(&mut self, kind: InterlockKind, now: SimSeconds) -> bool {
        self.emergency.reset_interlock(kind, now)
    }

    pub fn reset_all_interlocks(&mut self, now: SimSeconds) -> Vec<InterlockKind> {
        self.emergency.reset_all_interlocks(now)
    }

    /// Release a held shutdown and begin recovery. Refused unless the plant
    /// is in `Shutdown` with every interlock reset.
    pub fn operator_reset(&mut self, now: SimSeconds) -> Result<()> {
        if self.state != SystemState::Shutdown {
            return Err(TransientError::ResetNotPermitted(self.state));
        }
        let tripped = self.emergency.tripped_interlocks();
        if !tripped.is_empty() {
            warn!(
                target: "kpp::transient::controller",
                tripped = ?tripped,
                "operator reset refused"
            );
            return Err(TransientError::InterlocksTripped(tripped));
        }
        self.emergency.clear_shutdown(now);
        self.transition(SystemState::Recovering, "operator reset", now);
        Ok(())
    }

    pub fn status(&self, now: SimSeconds) -> ControllerStatus {
        ControllerStatus {
            system_state: self.state,
            primary_event_type: self.primary,
            pre_emergency_state: self.pre_emergency,
            ticks: self.ticks,
            last_update: self.last_update,
            handler_faults: self.handler_faults,
            startup: self.startup.status(),
            emergency: self.emergency.status(now),
            grid: self.grid.status(),
            transitions: self.transitions.iter().cloned().collect(),
        }
    }
}

/// Run a leaf call, converting a panic into a [`TransientError::HandlerFault`].
fn guarded<T>(component: &'static str, call: impl FnOnce() -> T) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(call)).map_err(|payload| TransientError::HandlerFault {
        component,
        detail: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_converts_panics() {
        let err = guarded("grid", || -> u32 { panic!("window underflow") }).unwrap_err();
        assert_eq!(
            err,
            TransientError::HandlerFault {
                component: "grid",
                detail: "window underflow".into(),
            }
        );
        assert_eq!(guarded("grid", || 7).unwrap(), 7);
    }

    #[test]
    fn starts_offline_and_refuses_reset() {
        let mut controller = TransientEventController::new(TransientConfig::default(), None);
        assert_eq!(controller.state(), SystemState::Offline);
        assert_eq!(
            controller.operator_reset(0.0),
            Err(TransientError::ResetNotPermitted(SystemState::Offline))
        );
    }

    #[test]
    fn manual_emergency_enters_and_leaves_emergency_state() {
        let mut controller = TransientEventController::new(TransientConfig::default(), None);
        let id = controller.trigger_manual_emergency(EmergencySeverity::Warning, "drill", 1.0);
        assert_eq!(controller.state(), SystemState::EmergencyActive);
        controller.resolve_emergency(id, 2.0).unwrap();
        assert_eq!(controller.state(), SystemState::Offline);
        assert_eq!(controller.transitions().len(), 2);
    }
}
