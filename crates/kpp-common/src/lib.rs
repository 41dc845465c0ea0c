//! ---
//! kpp_section: "01-core-functionality"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Shared primitives and utilities for the core runtime."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Core shared primitives for the KPP workspace.
//! This crate exposes configuration loading, logging, and simulation-time
//! helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ControllerConfig, EmergencyConfig, GridDisturbanceConfig, GridNominal, InterlockThresholds,
    LoadedAppConfig, LoggingConfig, MetricsConfig, PhaseTimeouts, SeverityThresholds,
    SimulationConfig, StartupConfig, TransientConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::SimSeconds;
