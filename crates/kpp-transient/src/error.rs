//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::emergency::{EmergencyId, InterlockKind};
use crate::startup::StartupPhase;
use crate::SystemState;

pub type Result<T> = std::result::Result<T, TransientError>;

/// Errors returned by operator-facing operations of the coordination layer.
///
/// Detection-time faults are not errors; they are recorded as events and
/// classified with [`FaultKind`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransientError {
    #[error("startup sequence already active in phase {0}")]
    StartupAlreadyActive(StartupPhase),
    #[error("cannot initiate startup while system is {0}")]
    StartupNotPermitted(SystemState),
    #[error("safety interlocks still tripped: {}", join_interlocks(.0))]
    InterlocksTripped(Vec<InterlockKind>),
    #[error("unknown emergency type '{0}'")]
    UnknownEmergencyType(String),
    #[error("unknown emergency severity '{0}'")]
    UnknownSeverity(String),
    #[error("emergency {0} is not active")]
    UnknownEmergency(EmergencyId),
    #[error("unknown safety interlock '{0}'")]
    UnknownInterlock(String),
    #[error("operator reset requires the shutdown state, system is {0}")]
    ResetNotPermitted(SystemState),
    #[error("{component} handler fault: {detail}")]
    HandlerFault {
        component: &'static str,
        detail: String,
    },
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

fn join_interlocks(kinds: &[InterlockKind]) -> String {
    kinds
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Classification of faults recorded by the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    PhaseTimeout,
    SystemCheckFailure,
    SynchronizationExhausted,
    Aborted,
    SafetyInterlockTripped,
    CriticalEmergency,
    UnknownEmergencyType,
    DisturbanceDetected,
    UnresolvedDisturbanceTimeout,
    HandlerFault,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::PhaseTimeout => "phase_timeout",
            FaultKind::SystemCheckFailure => "system_check_failure",
            FaultKind::SynchronizationExhausted => "synchronization_exhausted",
            FaultKind::Aborted => "aborted",
            FaultKind::SafetyInterlockTripped => "safety_interlock_tripped",
            FaultKind::CriticalEmergency => "critical_emergency",
            FaultKind::UnknownEmergencyType => "unknown_emergency_type",
            FaultKind::DisturbanceDetected => "disturbance_detected",
            FaultKind::UnresolvedDisturbanceTimeout => "unresolved_disturbance_timeout",
            FaultKind::HandlerFault => "handler_fault",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
