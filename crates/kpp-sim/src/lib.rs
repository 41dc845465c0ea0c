//! ---
//! kpp_section: "06-simulation"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Plant model and scenario scripts driving the transient controller."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Plant model and scenario scripts used to drive the transient controller
//! without hardware.

pub mod plant;
pub mod scenario;

pub use plant::{GridCondition, PlantInjection, PlantModel, PlantParameters, PlantState};
pub use scenario::{OperatorAction, ScenarioCursor, ScenarioEvent, ScenarioScript, ScenarioStep};
