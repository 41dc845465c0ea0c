//! ---
//! kpp_section: "01-core-functionality"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Primary orchestration and lifecycle management."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Runtime orchestration for KPP: the controller actor and the closed plant
//! loop that drives it.

pub mod orchestrator;

pub use orchestrator::{
    ControllerHandle, ControllerRuntime, LoopOptions, PlantLoop, RunReport, StopReason,
};
