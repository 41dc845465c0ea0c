//! ---
//! kpp_section: "15-testing-qa-runbook"
//! kpp_subsection: "integration-tests"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Integration and validation tests for the KPP stack."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::Result;
use kpp_common::config::AppConfig;
use kpp_core::{ControllerRuntime, LoopOptions, PlantLoop, RunReport, StopReason};
use kpp_sim::ScenarioScript;
use kpp_transient::{InterlockKind, SystemState};
use tokio::sync::broadcast;

fn repo_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(relative)
}

/// Run a bundled scenario against the example configuration, sensor noise
/// included.
async fn run_bundled(scenario: &str) -> Result<RunReport> {
    let config = AppConfig::from_path(&repo_path("configs/kpp.example.toml"))?;
    let script = ScenarioScript::from_path(&repo_path(&format!("scenarios/{}", scenario)))?;
    let runtime = ControllerRuntime::spawn(config.transient.clone(), None);
    let plant_loop = PlantLoop::new(&config.simulation, &config.transient, runtime.handle())?
        .with_scenario(&script);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let report = plant_loop.run(LoopOptions::default(), shutdown_rx).await?;
    runtime.shutdown().await?;
    assert_eq!(report.stop_reason, StopReason::ScenarioComplete);
    assert_eq!(report.handler_faults, 0);
    Ok(report)
}

#[tokio::test]
async fn nominal_startup_scenario_synchronises() -> Result<()> {
    let report = run_bundled("nominal_startup.json").await?;
    assert_eq!(report.final_state, SystemState::Operational);
    assert_eq!(report.emergencies_triggered, 0);
    let startup = &report.final_status.startup;
    assert!(startup.failure.is_none());
    let completed = startup.completed_at.expect("startup completion recorded");
    assert!(completed < 95.0, "startup completed late at {}", completed);
    Ok(())
}

#[tokio::test]
async fn grid_sag_is_ridden_through_without_emergencies() -> Result<()> {
    let report = run_bundled("grid_sag.json").await?;
    assert_eq!(report.final_state, SystemState::Operational);
    assert_eq!(report.emergencies_triggered, 0);
    assert!(report.final_status.grid.recovered >= 1);
    assert!(report.final_status.grid.active.is_empty());
    Ok(())
}

#[tokio::test]
async fn grid_outage_scenario_isolates_and_reconnects() -> Result<()> {
    let report = run_bundled("grid_outage.json").await?;
    assert!(report.states_visited.contains(&SystemState::EmergencyActive));
    assert_eq!(report.final_state, SystemState::Operational);
    assert_eq!(report.emergencies_triggered, 1);
    assert!(report.final_status.emergency.shutdown.is_none());
    Ok(())
}

#[tokio::test]
async fn overspeed_scenario_ends_offline_after_reset() -> Result<()> {
    let report = run_bundled("overspeed_trip.json").await?;
    assert!(report.states_visited.contains(&SystemState::Shutdown));
    assert_eq!(report.final_state, SystemState::Offline);
    let interlock = report
        .final_status
        .emergency
        .interlocks
        .iter()
        .find(|interlock| interlock.kind == InterlockKind::Overspeed)
        .expect("overspeed interlock listed");
    assert_eq!(interlock.trip_count, 1);
    assert!(!interlock.tripped);
    Ok(())
}

#[tokio::test]
async fn frequency_oscillation_is_damped_while_operational() -> Result<()> {
    let report = run_bundled("frequency_oscillation.json").await?;
    assert_eq!(report.final_state, SystemState::Operational);
    assert!(!report
        .transitions
        .iter()
        .any(|transition| transition.to == SystemState::EmergencyActive));
    assert!(report.final_status.grid.total_detected >= 1);
    Ok(())
}

#[test]
fn every_bundled_scenario_parses() -> Result<()> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(repo_path("scenarios"))? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            let script = ScenarioScript::from_path(&path)?;
            assert!(script.duration.is_some(), "{} has no duration", path.display());
            names.push(script.name);
        }
    }
    assert!(names.len() >= 5);
    Ok(())
}
