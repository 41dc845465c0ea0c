//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Shutdown procedures. Each procedure is a separate command schedule over
//! simulation time; the responder holds at most one running execution and
//! only ever replaces it with a harder procedure.

use std::fmt;
use std::time::Duration;

use kpp_common::config::EmergencyConfig;
use kpp_common::time::{elapsed, ramp_fraction, SimSeconds};
use serde::{Deserialize, Serialize};

use super::EmergencyType;
use crate::commands::{
    CommandSet, ControlCommands, ElectricalCommands, EmergencyDirectives, PneumaticCommands,
};

/// Shutdown procedures, declared in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownProcedure {
    Isolation,
    Gradual,
    Controlled,
    Immediate,
}

impl ShutdownProcedure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownProcedure::Isolation => "isolation",
            ShutdownProcedure::Gradual => "gradual",
            ShutdownProcedure::Controlled => "controlled",
            ShutdownProcedure::Immediate => "immediate",
        }
    }

    /// Procedure matching the fault domain of an emergency.
    pub fn for_emergency(kind: EmergencyType) -> Self {
        match kind {
            EmergencyType::Electrical
            | EmergencyType::Thermal
            | EmergencyType::SafetyViolation
            | EmergencyType::Manual => ShutdownProcedure::Immediate,
            EmergencyType::Mechanical => ShutdownProcedure::Controlled,
            EmergencyType::Control | EmergencyType::Environmental => ShutdownProcedure::Gradual,
            EmergencyType::Grid => ShutdownProcedure::Isolation,
        }
    }

    /// Everything except isolation brings the plant to rest.
    pub fn stops_plant(&self) -> bool {
        !matches!(self, ShutdownProcedure::Isolation)
    }

    fn ramp(&self, config: &EmergencyConfig) -> Duration {
        match self {
            ShutdownProcedure::Controlled => config.controlled_ramp,
            ShutdownProcedure::Gradual => config.gradual_ramp,
            ShutdownProcedure::Isolation | ShutdownProcedure::Immediate => Duration::ZERO,
        }
    }
}

impl fmt::Display for ShutdownProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating point the gradual ramp descends from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampBaseline {
    pub pressure_bar: f64,
    pub injection_frequency_hz: f64,
    pub speed_rpm: f64,
}

impl Default for RampBaseline {
    fn default() -> Self {
        Self {
            pressure_bar: 5.0,
            injection_frequency_hz: 1.0,
            speed_rpm: 375.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownProgress {
    pub procedure: ShutdownProcedure,
    pub started_at: SimSeconds,
    pub progress: f64,
    pub complete: bool,
    pub reason: String,
}

/// A running (or completed and held) shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownExecution {
    procedure: ShutdownProcedure,
    started_at: SimSeconds,
    ramp: Duration,
    baseline: RampBaseline,
    reason: String,
}

impl ShutdownExecution {
    pub fn start(
        procedure: ShutdownProcedure,
        config: &EmergencyConfig,
        baseline: RampBaseline,
        reason: impl Into<String>,
        now: SimSeconds,
    ) -> Self {
        Self {
            procedure,
            started_at: now,
            ramp: procedure.ramp(config),
            baseline,
            reason: reason.into(),
        }
    }

    pub fn procedure(&self) -> ShutdownProcedure {
        self.procedure
    }

    pub fn started_at(&self) -> SimSeconds {
        self.started_at
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_complete(&self, now: SimSeconds) -> bool {
        elapsed(self.started_at, now) >= self.ramp
    }

    pub fn progress(&self, now: SimSeconds) -> ShutdownProgress {
        ShutdownProgress {
            procedure: self.procedure,
            started_at: self.started_at,
            progress: ramp_fraction(self.started_at, now, self.ramp),
            complete: self.is_complete(now),
            reason: self.reason.clone(),
        }
    }

    /// Coarse directives currently asserted.
    pub fn directives(&self, now: SimSeconds) -> EmergencyDirectives {
        match self.procedure {
            ShutdownProcedure::Immediate => EmergencyDirectives::all(),
            ShutdownProcedure::Isolation => EmergencyDirectives {
                electrical_disconnect: true,
                ..EmergencyDirectives::default()
            },
            ShutdownProcedure::Controlled | ShutdownProcedure::Gradual => {
                if self.is_complete(now) {
                    EmergencyDirectives::all()
                } else {
                    EmergencyDirectives {
                        pneumatic_stop: self.procedure == ShutdownProcedure::Controlled,
                        ..EmergencyDirectives::default()
                    }
                }
            }
        }
    }

    /// Actuator commands for this tick.
    pub fn commands(&self, now: SimSeconds) -> CommandSet {
        match self.procedure {
            ShutdownProcedure::Immediate => CommandSet::safe_stop(),
            ShutdownProcedure::Isolation => self.isolation_commands(),
            ShutdownProcedure::Controlled if !self.is_complete(now) => self.controlled_commands(now),
            ShutdownProcedure::Gradual if !self.is_complete(now) => self.gradual_commands(now),
            ShutdownProcedure::Controlled | ShutdownProcedure::Gradual => CommandSet::safe_stop(),
        }
    }

    fn remaining(&self, now: SimSeconds) -> f64 {
        1.0 - ramp_fraction(self.started_at, now, self.ramp)
    }

    fn isolation_commands(&self) -> CommandSet {
        CommandSet {
            electrical: ElectricalCommands {
                grid_connect: Some(false),
                synchronization_enable: Some(false),
                ..ElectricalCommands::default()
            },
            control: ControlCommands {
                islanded_mode: Some(true),
                ..ControlCommands::default()
            },
            ..CommandSet::default()
        }
    }

    fn controlled_commands(&self, now: SimSeconds) -> CommandSet {
        CommandSet {
            pneumatic: PneumaticCommands {
                compressor_enabled: Some(false),
                injection_enabled: Some(false),
                injection_frequency: Some(0.0),
                ..PneumaticCommands::default()
            },
            electrical: ElectricalCommands {
                load_factor: Some(self.remaining(now)),
                ..ElectricalCommands::default()
            },
            ..CommandSet::default()
        }
    }

    fn gradual_commands(&self, now: SimSeconds) -> CommandSet {
        let remaining = self.remaining(now);
        CommandSet {
            pneumatic: PneumaticCommands {
                pressure_setpoint: Some(self.baseline.pressure_bar * remaining),
                injection_frequency: Some(self.baseline.injection_frequency_hz * remaining),
                ..PneumaticCommands::default()
            },
            electrical: ElectricalCommands {
                load_factor: Some(remaining),
                ..ElectricalCommands::default()
            },
            control: ControlCommands {
                speed_setpoint: Some(self.baseline.speed_rpm * remaining),
                ..ControlCommands::default()
            },
            ..CommandSet::default()
        }
    }
}
