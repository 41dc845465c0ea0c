//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Startup sequencing from a cold plant to grid synchronisation.
//!
//! Every non-terminal phase carries a timeout measured against the
//! caller-supplied simulation time; a phase that fails to advance within its
//! window puts the sequencer into [`StartupPhase::Failed`] and asserts the
//! fail-safe [`EmergencyDirectives`]. The sequencer advances at most one
//! phase per tick.

use std::fmt;
use std::time::Duration;

use kpp_common::config::StartupConfig;
use kpp_common::time::{elapsed, has_expired, ramp_fraction, SimSeconds};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandSet, ControlCommands, ElectricalCommands, EmergencyDirectives};
use crate::error::{FaultKind, Result, TransientError};
use crate::history::BoundedHistory;
use crate::metrics::TransientMetrics;
use crate::snapshot::StartupInputs;

const PHASE_HISTORY_CAPACITY: usize = 32;
const SEQUENCED_PHASES: f64 = 6.0;

/// Ordered startup phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    Initialization,
    SystemChecks,
    PressureBuild,
    FirstInjection,
    Acceleration,
    Synchronization,
    Operational,
    Failed,
}

impl StartupPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupPhase::Initialization => "initialization",
            StartupPhase::SystemChecks => "system_checks",
            StartupPhase::PressureBuild => "pressure_build",
            StartupPhase::FirstInjection => "first_injection",
            StartupPhase::Acceleration => "acceleration",
            StartupPhase::Synchronization => "synchronization",
            StartupPhase::Operational => "operational",
            StartupPhase::Failed => "failed",
        }
    }

    /// Phase that follows a successful advance. Terminal phases have none.
    pub fn next(&self) -> Option<StartupPhase> {
        match self {
            StartupPhase::Initialization => Some(StartupPhase::SystemChecks),
            StartupPhase::SystemChecks => Some(StartupPhase::PressureBuild),
            StartupPhase::PressureBuild => Some(StartupPhase::FirstInjection),
            StartupPhase::FirstInjection => Some(StartupPhase::Acceleration),
            StartupPhase::Acceleration => Some(StartupPhase::Synchronization),
            StartupPhase::Synchronization => Some(StartupPhase::Operational),
            StartupPhase::Operational | StartupPhase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StartupPhase::Operational | StartupPhase::Failed)
    }

    fn ordinal(&self) -> f64 {
        match self {
            StartupPhase::Initialization => 0.0,
            StartupPhase::SystemChecks => 1.0,
            StartupPhase::PressureBuild => 2.0,
            StartupPhase::FirstInjection => 3.0,
            StartupPhase::Acceleration => 4.0,
            StartupPhase::Synchronization => 5.0,
            StartupPhase::Operational | StartupPhase::Failed => SEQUENCED_PHASES,
        }
    }

    pub fn timeout(&self, config: &StartupConfig) -> Option<Duration> {
        let timeouts = &config.phase_timeouts;
        match self {
            StartupPhase::Initialization => Some(timeouts.initialization),
            StartupPhase::SystemChecks => Some(timeouts.system_checks),
            StartupPhase::PressureBuild => Some(timeouts.pressure_build),
            StartupPhase::FirstInjection => Some(timeouts.first_injection),
            StartupPhase::Acceleration => Some(timeouts.acceleration),
            StartupPhase::Synchronization => Some(timeouts.synchronization),
            StartupPhase::Operational | StartupPhase::Failed => None,
        }
    }
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failing system-check sub-check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckFault {
    pub check: String,
    pub detail: String,
    pub observed: f64,
    pub limit: f64,
    pub at: SimSeconds,
}

/// Why a startup ended in [`StartupPhase::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupFailure {
    pub kind: FaultKind,
    pub phase: StartupPhase,
    pub reason: String,
    pub at: SimSeconds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseRecord {
    pub phase: StartupPhase,
    pub entered_at: SimSeconds,
    pub exited_at: Option<SimSeconds>,
}

/// Per-tick result of [`StartupSequencer::update`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupOutput {
    pub active: bool,
    pub current_phase: StartupPhase,
    /// Overall progress through the sequenced phases, `0.0..=1.0`.
    pub progress: f64,
    pub phase_progress: f64,
    pub phase_elapsed: f64,
    /// Set only on the tick the sequence reached `Operational`.
    pub startup_complete: bool,
    pub startup_failed: bool,
    /// Set only on the tick the sequence failed.
    pub newly_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FaultKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<CheckFault>,
    pub sync_attempts: u32,
    pub commands: CommandSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emergency_commands: Option<EmergencyDirectives>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupStatus {
    pub active: bool,
    pub phase: StartupPhase,
    pub started_at: Option<SimSeconds>,
    pub phase_started_at: SimSeconds,
    pub completed_at: Option<SimSeconds>,
    pub sync_attempts: u32,
    pub fault_count: usize,
    pub failure: Option<StartupFailure>,
    pub phases: Vec<PhaseRecord>,
}

enum PhaseStep {
    Stay,
    Advance,
    Fail(FaultKind, String),
}

struct PhaseResult {
    commands: CommandSet,
    progress: f64,
    step: PhaseStep,
}

impl PhaseResult {
    fn stay(commands: CommandSet, progress: f64) -> Self {
        Self {
            commands,
            progress,
            step: PhaseStep::Stay,
        }
    }

    fn advance_when(commands: CommandSet, progress: f64, advance: bool) -> Self {
        Self {
            commands,
            progress: if advance { 1.0 } else { progress },
            step: if advance {
                PhaseStep::Advance
            } else {
                PhaseStep::Stay
            },
        }
    }
}

/// Drives the plant through the ordered startup phases.
#[derive(Debug)]
pub struct StartupSequencer {
    config: StartupConfig,
    phase: StartupPhase,
    active: bool,
    started_at: Option<SimSeconds>,
    phase_started_at: SimSeconds,
    completed_at: Option<SimSeconds>,
    faults: Vec<CheckFault>,
    pending_checks: Vec<String>,
    sync_attempts: u32,
    next_sync_attempt_at: SimSeconds,
    failure: Option<StartupFailure>,
    last_progress: f64,
    phases: BoundedHistory<PhaseRecord>,
    metrics: Option<TransientMetrics>,
}

impl StartupSequencer {
    pub fn new(config: StartupConfig) -> Self {
        Self {
            config,
            phase: StartupPhase::Initialization,
            active: false,
            started_at: None,
            phase_started_at: 0.0,
            completed_at: None,
            faults: Vec::new(),
            pending_checks: Vec::new(),
            sync_attempts: 0,
            next_sync_attempt_at: 0.0,
            failure: None,
            last_progress: 0.0,
            phases: BoundedHistory::new(PHASE_HISTORY_CAPACITY),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<TransientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn phase(&self) -> StartupPhase {
        self.phase
    }

    pub fn sync_attempts(&self) -> u32 {
        self.sync_attempts
    }

    pub fn faults(&self) -> &[CheckFault] {
        &self.faults
    }

    pub fn failure(&self) -> Option<&StartupFailure> {
        self.failure.as_ref()
    }

    pub fn config(&self) -> &StartupConfig {
        &self.config
    }

    /// Begin a new startup sequence.
    pub fn initiate(&mut self, now: SimSeconds) -> Result<()> {
        if self.active {
            return Err(TransientError::StartupAlreadyActive(self.phase));
        }
        self.active = true;
        self.started_at = Some(now);
        self.completed_at = None;
        self.faults.clear();
        self.pending_checks.clear();
        self.sync_attempts = 0;
        self.next_sync_attempt_at = now;
        self.failure = None;
        self.last_progress = 0.0;
        self.phase = StartupPhase::Initialization;
        self.phase_started_at = now;
        self.phases.push(PhaseRecord {
            phase: StartupPhase::Initialization,
            entered_at: now,
            exited_at: None,
        });
        info!(target: "kpp::transient::startup", now, "startup sequence initiated");
        Ok(())
    }

    /// Abort the running sequence with an operator reason. A no-op returning
    /// `false` when nothing is running.
    pub fn abort(&mut self, reason: &str, now: SimSeconds) -> bool {
        if !self.active {
            debug!(target: "kpp::transient::startup", reason, "abort ignored; no startup active");
            return false;
        }
        self.fail(FaultKind::Aborted, format!("aborted: {}", reason), now);
        true
    }

    /// Advance the sequence by one tick.
    pub fn update(&mut self, inputs: &StartupInputs<'_>, now: SimSeconds) -> StartupOutput {
        if !self.active {
            return self.output(now, CommandSet::default(), false, false);
        }

        let phase = self.phase;
        if let Some(timeout) = phase.timeout(&self.config) {
            if has_expired(self.phase_started_at, now, timeout) {
                let (kind, reason) = self.timeout_failure(phase, timeout);
                self.fail(kind, reason, now);
                return self.output(now, CommandSet::default(), false, true);
            }
        }

        let result = match phase {
            StartupPhase::Initialization => self.run_initialization(inputs, now),
            StartupPhase::SystemChecks => self.run_system_checks(inputs, now),
            StartupPhase::PressureBuild => self.run_pressure_build(inputs, now),
            StartupPhase::FirstInjection => self.run_first_injection(inputs),
            StartupPhase::Acceleration => self.run_acceleration(inputs, now),
            StartupPhase::Synchronization => self.run_synchronization(inputs, now),
            StartupPhase::Operational | StartupPhase::Failed => {
                // Terminal phases clear `active`; reaching here means the flag
                // and phase disagree, which is reported rather than ignored.
                self.fail(
                    FaultKind::HandlerFault,
                    format!("sequencer active in terminal phase {}", phase),
                    now,
                );
                return self.output(now, CommandSet::default(), false, true);
            }
        };

        self.last_progress = (phase.ordinal() + result.progress.clamp(0.0, 1.0)) / SEQUENCED_PHASES;
        match result.step {
            PhaseStep::Stay => self.output(now, result.commands, false, false),
            PhaseStep::Advance => {
                let completed = self.advance(now);
                self.output(now, result.commands, completed, false)
            }
            PhaseStep::Fail(kind, reason) => {
                self.fail(kind, reason, now);
                self.output(now, CommandSet::default(), false, true)
            }
        }
    }

    /// Output for the current state without advancing anything.
    pub fn current_output(&self, now: SimSeconds) -> StartupOutput {
        self.output(now, CommandSet::default(), false, false)
    }

    /// Fail a running sequence because its handler misbehaved. Returns false
    /// when nothing was running.
    pub fn fail_with_handler_fault(&mut self, detail: &str, now: SimSeconds) -> bool {
        if !self.active {
            return false;
        }
        self.fail(FaultKind::HandlerFault, detail.to_owned(), now);
        true
    }

    pub fn status(&self) -> StartupStatus {
        StartupStatus {
            active: self.active,
            phase: self.phase,
            started_at: self.started_at,
            phase_started_at: self.phase_started_at,
            completed_at: self.completed_at,
            sync_attempts: self.sync_attempts,
            fault_count: self.faults.len(),
            failure: self.failure.clone(),
            phases: self.phases.iter().cloned().collect(),
        }
    }

    fn timeout_failure(&self, phase: StartupPhase, timeout: Duration) -> (FaultKind, String) {
        if phase == StartupPhase::SystemChecks && !self.pending_checks.is_empty() {
            (
                FaultKind::SystemCheckFailure,
                format!(
                    "system checks did not pass within {:.1}s: {}",
                    timeout.as_secs_f64(),
                    self.pending_checks.join("; ")
                ),
            )
        } else {
            (
                FaultKind::PhaseTimeout,
                format!(
                    "{} phase timed out after {:.1}s",
                    phase,
                    timeout.as_secs_f64()
                ),
            )
        }
    }

    fn run_initialization(&mut self, inputs: &StartupInputs<'_>, now: SimSeconds) -> PhaseResult {
        let dwell = self.config.initialization_dwell;
        let progress = ramp_fraction(self.phase_started_at, now, dwell);
        let dwell_elapsed = elapsed(self.phase_started_at, now) >= dwell;
        PhaseResult::advance_when(
            CommandSet::idle_hold(),
            progress,
            dwell_elapsed && inputs.readings_valid,
        )
    }

    fn run_system_checks(&mut self, inputs: &StartupInputs<'_>, now: SimSeconds) -> PhaseResult {
        let config = &self.config;
        let mut failing = Vec::new();

        if inputs.tank_pressure < config.min_check_pressure_bar {
            failing.push(CheckFault {
                check: "pneumatic_pressure".into(),
                detail: format!(
                    "tank pressure {:.2} bar below minimum {:.2} bar",
                    inputs.tank_pressure, config.min_check_pressure_bar
                ),
                observed: inputs.tank_pressure,
                limit: config.min_check_pressure_bar,
                at: now,
            });
        }
        for (component, temperature) in inputs.component_temperatures {
            if *temperature > config.max_component_temperature_c {
                failing.push(CheckFault {
                    check: format!("temperature:{}", component),
                    detail: format!(
                        "{} at {:.1} C exceeds {:.1} C",
                        component, temperature, config.max_component_temperature_c
                    ),
                    observed: *temperature,
                    limit: config.max_component_temperature_c,
                    at: now,
                });
            }
        }
        if inputs.floater_count < config.min_floater_count {
            failing.push(CheckFault {
                check: "floater_count".into(),
                detail: format!(
                    "{} floaters reporting, {} required",
                    inputs.floater_count, config.min_floater_count
                ),
                observed: inputs.floater_count as f64,
                limit: config.min_floater_count as f64,
                at: now,
            });
        }

        let total_checks = 2 + inputs.component_temperatures.len();
        let passed = total_checks.saturating_sub(failing.len());
        let progress = passed as f64 / total_checks as f64;

        self.pending_checks = failing.iter().map(|fault| fault.detail.clone()).collect();
        for fault in failing {
            self.record_fault(fault);
        }

        PhaseResult::advance_when(
            CommandSet::idle_hold(),
            progress,
            self.pending_checks.is_empty(),
        )
    }

    fn record_fault(&mut self, fault: CheckFault) {
        match self.faults.iter_mut().find(|known| known.check == fault.check) {
            Some(known) => *known = fault,
            None => {
                warn!(
                    target: "kpp::transient::startup",
                    check = %fault.check,
                    observed = fault.observed,
                    limit = fault.limit,
                    "system check failing"
                );
                self.faults.push(fault);
            }
        }
    }

    fn run_pressure_build(&mut self, inputs: &StartupInputs<'_>, now: SimSeconds) -> PhaseResult {
        let target = self.config.target_pressure_bar;
        let ramp = ramp_fraction(self.phase_started_at, now, self.config.pressure_ramp);
        let mut commands = CommandSet::idle_hold();
        commands.pneumatic.compressor_enabled = Some(true);
        commands.pneumatic.pressure_setpoint = Some(target * ramp);
        commands.pneumatic.vent_valves_open = Some(false);
        let progress = (inputs.tank_pressure / target).clamp(0.0, 1.0);
        PhaseResult::advance_when(commands, progress, inputs.tank_pressure >= target)
    }

    fn run_first_injection(&mut self, inputs: &StartupInputs<'_>) -> PhaseResult {
        let config = &self.config;
        let mut commands = self.running_pneumatics();
        commands.pneumatic.injection_frequency = Some(config.first_injection_frequency_hz);
        commands.mechanical.mechanical_brake = Some(false);
        let progress = (inputs.chain_speed_rpm / config.first_motion_speed_rpm).clamp(0.0, 1.0);
        let moving = inputs.chain_speed_rpm >= config.first_motion_speed_rpm;
        PhaseResult::advance_when(commands, progress, moving)
    }

    fn run_acceleration(&mut self, inputs: &StartupInputs<'_>, now: SimSeconds) -> PhaseResult {
        let config = &self.config;
        let ramp = ramp_fraction(self.phase_started_at, now, config.acceleration_ramp);
        let injection = config.first_injection_frequency_hz
            + (config.max_injection_frequency_hz - config.first_injection_frequency_hz) * ramp;
        let mut commands = self.running_pneumatics();
        commands.pneumatic.injection_frequency = Some(injection);
        commands.mechanical.mechanical_brake = Some(false);
        commands.control = ControlCommands {
            speed_setpoint: Some(config.target_speed_rpm * ramp),
            ..ControlCommands::default()
        };
        let threshold = config.target_speed_rpm * (1.0 - config.speed_tolerance);
        let progress = (inputs.flywheel_speed_rpm / threshold).clamp(0.0, 1.0);
        PhaseResult::advance_when(commands, progress, inputs.flywheel_speed_rpm >= threshold)
    }

    fn run_synchronization(&mut self, inputs: &StartupInputs<'_>, now: SimSeconds) -> PhaseResult {
        let config = &self.config;
        let mut commands = self.running_pneumatics();
        commands.pneumatic.injection_frequency = Some(config.max_injection_frequency_hz);
        commands.mechanical.mechanical_brake = Some(false);
        commands.control.speed_setpoint = Some(config.target_speed_rpm);
        commands.electrical = ElectricalCommands {
            generator_enable: Some(true),
            synchronization_enable: Some(true),
            grid_connect: Some(false),
            ..ElectricalCommands::default()
        };

        let limit = config.sync_retry_limit;
        let progress = f64::from(self.sync_attempts) / f64::from(limit + 1);
        if now < self.next_sync_attempt_at {
            return PhaseResult::stay(commands, progress);
        }

        match self.synchronization_mismatch(inputs) {
            None => {
                commands.electrical.grid_connect = Some(true);
                commands.electrical.load_factor = Some(0.0);
                info!(
                    target: "kpp::transient::startup",
                    retries = self.sync_attempts,
                    "generator synchronised with grid"
                );
                PhaseResult::advance_when(commands, 1.0, true)
            }
            Some(mismatch) => {
                self.sync_attempts += 1;
                if self.sync_attempts > limit {
                    return PhaseResult {
                        commands,
                        progress,
                        step: PhaseStep::Fail(
                            FaultKind::SynchronizationExhausted,
                            format!(
                                "synchronisation failed after {} retries: {}",
                                limit, mismatch
                            ),
                        ),
                    };
                }
                self.next_sync_attempt_at = now + config.sync_retry_interval.as_secs_f64();
                warn!(
                    target: "kpp::transient::startup",
                    retry = self.sync_attempts,
                    limit,
                    reason = %mismatch,
                    "synchronisation attempt failed; retry scheduled"
                );
                PhaseResult::stay(commands, progress)
            }
        }
    }

    /// Describe why the generator cannot be paralleled with the grid, if it
    /// cannot.
    fn synchronization_mismatch(&self, inputs: &StartupInputs<'_>) -> Option<String> {
        let config = &self.config;
        if !inputs.grid_connected {
            return Some("grid unavailable".into());
        }
        let voltage_deviation =
            (inputs.grid_voltage - config.nominal.nominal_voltage_v).abs() / config.nominal.nominal_voltage_v;
        if voltage_deviation > config.sync_voltage_tolerance {
            return Some(format!(
                "grid voltage {:.1} V outside {:.0}% window",
                inputs.grid_voltage,
                config.sync_voltage_tolerance * 100.0
            ));
        }
        let generator_frequency =
            inputs.flywheel_speed_rpm / config.synchronous_speed_rpm * config.nominal.nominal_frequency_hz;
        let slip = (generator_frequency - inputs.grid_frequency).abs();
        if slip > config.sync_frequency_tolerance_hz {
            return Some(format!(
                "frequency slip {:.3} Hz exceeds {:.3} Hz",
                slip, config.sync_frequency_tolerance_hz
            ));
        }
        None
    }

    fn running_pneumatics(&self) -> CommandSet {
        let mut commands = CommandSet::idle_hold();
        commands.pneumatic.compressor_enabled = Some(true);
        commands.pneumatic.injection_enabled = Some(true);
        commands.pneumatic.vent_valves_open = Some(false);
        commands.pneumatic.pressure_setpoint = Some(self.config.target_pressure_bar);
        commands
    }

    /// Move to the next phase. Returns true when the sequence completed.
    fn advance(&mut self, now: SimSeconds) -> bool {
        let Some(next) = self.phase.next() else {
            return false;
        };
        let previous = self.phase;
        info!(
            target: "kpp::transient::startup",
            from = %previous,
            to = %next,
            elapsed = elapsed(self.phase_started_at, now).as_secs_f64(),
            "startup phase advanced"
        );
        self.enter_phase(next, now);
        if next == StartupPhase::Operational {
            self.active = false;
            self.completed_at = Some(now);
            self.last_progress = 1.0;
            if let Some(metrics) = &self.metrics {
                metrics.record_startup_outcome("completed");
            }
            info!(
                target: "kpp::transient::startup",
                duration = self.started_at.map(|start| now - start).unwrap_or_default(),
                "startup sequence complete"
            );
            return true;
        }
        if next == StartupPhase::Synchronization {
            self.next_sync_attempt_at = now;
        }
        false
    }

    fn enter_phase(&mut self, phase: StartupPhase, now: SimSeconds) {
        if let Some(record) = self.phases.iter_mut().next_back() {
            if record.exited_at.is_none() {
                record.exited_at = Some(now);
            }
        }
        self.phase = phase;
        self.phase_started_at = now;
        self.phases.push(PhaseRecord {
            phase,
            entered_at: now,
            exited_at: None,
        });
    }

    fn fail(&mut self, kind: FaultKind, reason: String, now: SimSeconds) {
        let phase = self.phase;
        error!(
            target: "kpp::transient::startup",
            %phase,
            kind = %kind,
            reason = %reason,
            "startup sequence failed"
        );
        self.failure = Some(StartupFailure {
            kind,
            phase,
            reason,
            at: now,
        });
        self.active = false;
        self.enter_phase(StartupPhase::Failed, now);
        if let Some(metrics) = &self.metrics {
            metrics.record_startup_outcome(kind.as_str());
        }
    }

    fn output(
        &self,
        now: SimSeconds,
        commands: CommandSet,
        startup_complete: bool,
        newly_failed: bool,
    ) -> StartupOutput {
        let failed = self.phase == StartupPhase::Failed;
        let (commands, emergency_commands) = if failed {
            (CommandSet::safe_stop(), Some(EmergencyDirectives::all()))
        } else {
            (commands, None)
        };
        let phase_progress = if self.phase.is_terminal() {
            1.0
        } else {
            (self.last_progress * SEQUENCED_PHASES - self.phase.ordinal()).clamp(0.0, 1.0)
        };
        StartupOutput {
            active: self.active,
            current_phase: self.phase,
            progress: self.last_progress,
            phase_progress,
            phase_elapsed: elapsed(self.phase_started_at, now).as_secs_f64(),
            startup_complete,
            startup_failed: failed,
            newly_failed,
            failure_reason: self.failure.as_ref().map(|failure| failure.reason.clone()),
            failure_kind: self.failure.as_ref().map(|failure| failure.kind),
            faults: self.faults.clone(),
            sync_attempts: self.sync_attempts,
            commands,
            emergency_commands,
        }
    }
}
