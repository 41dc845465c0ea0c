//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Transient-event coordination for the KPP buoyancy plant: startup
//! sequencing, emergency response with latching interlocks, grid disturbance
//! handling and the controller arbitrating between them.
//!
//! All components are tick-driven and take simulation time from the caller.

pub mod commands;
pub mod controller;
pub mod emergency;
pub mod error;
pub mod grid;
pub mod history;
pub mod metrics;
pub mod snapshot;
pub mod startup;

pub use commands::{CommandSet, EmergencyDirectives};
pub use controller::{
    ControllerStatus, CoordinatedCommands, PrimaryEventType, StateTransition, SystemState,
    TransientEventController,
};
pub use emergency::{
    EmergencyEvent, EmergencyId, EmergencyResponder, EmergencySeverity, EmergencyState,
    EmergencyType, EventParams, InterlockKind, ShutdownProcedure,
};
pub use error::{FaultKind, Result, TransientError};
pub use grid::{
    DisturbanceEvent, DisturbanceSeverity, DisturbanceType, GridDisturbanceHandler, GridResponse,
    ResponseMode,
};
pub use metrics::TransientMetrics;
pub use snapshot::{GridMeasurement, InterlockReadings, StartupInputs, SystemSnapshot};
pub use startup::{StartupOutput, StartupPhase, StartupSequencer};

/// Commonly used types for embedding the controller.
pub mod prelude {
    pub use super::commands::{CommandSet, EmergencyDirectives};
    pub use super::controller::{
        CoordinatedCommands, PrimaryEventType, SystemState, TransientEventController,
    };
    pub use super::emergency::{EmergencySeverity, EmergencyType, InterlockKind};
    pub use super::snapshot::SystemSnapshot;
}
