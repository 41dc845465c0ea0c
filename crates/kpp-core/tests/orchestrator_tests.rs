//! ---
//! kpp_section: "01-core-functionality"
//! kpp_subsection: "tests"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Closed-loop tests for the controller actor and plant loop."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use kpp_common::config::{SimulationConfig, TransientConfig};
use kpp_core::{ControllerRuntime, LoopOptions, PlantLoop, RunReport, StopReason};
use kpp_metrics::{new_registry, LoopMetrics};
use kpp_sim::ScenarioScript;
use kpp_transient::{EmergencySeverity, InterlockKind, SystemState};
use tokio::sync::broadcast;

async fn run_scenario(script: &str) -> Result<RunReport> {
    let transient = TransientConfig::default();
    let runtime = ControllerRuntime::spawn(transient.clone(), None);
    let script: ScenarioScript = script.parse()?;
    let plant_loop = PlantLoop::new(&SimulationConfig::default(), &transient, runtime.handle())?
        .with_scenario(&script);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let report = plant_loop.run(LoopOptions::default(), shutdown_rx).await?;
    runtime.shutdown().await?;
    Ok(report)
}

#[tokio::test]
async fn plant_loop_completes_a_nominal_startup() -> Result<()> {
    let transient = TransientConfig::default();
    let runtime = ControllerRuntime::spawn(transient.clone(), None);
    let registry = new_registry();
    let plant_loop = PlantLoop::new(&SimulationConfig::default(), &transient, runtime.handle())?
        .with_metrics(LoopMetrics::new(registry.clone())?);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let options = LoopOptions {
        max_ticks: Some(2_400),
        initiate_startup: true,
        ..LoopOptions::default()
    };
    let report = plant_loop.run(options, shutdown_rx).await?;

    assert_eq!(report.stop_reason, StopReason::TickLimit);
    assert_eq!(report.ticks, 2_400);
    assert_eq!(report.final_state, SystemState::Operational);
    assert_eq!(
        report.states_visited,
        vec![SystemState::Starting, SystemState::Operational]
    );
    assert_eq!(report.emergencies_triggered, 0);
    assert_eq!(report.handler_faults, 0);
    assert!(report.final_status.startup.sync_attempts <= 3);

    let latest = runtime.handle().latest().expect("at least one tick recorded");
    assert_eq!(latest.commands.electrical.grid_connect, Some(true));

    let families = registry.gather();
    assert!(families
        .iter()
        .any(|family| family.get_name() == "kpp_loop_ticks_total"));
    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn grid_outage_is_ridden_through_in_island_mode() -> Result<()> {
    let report = run_scenario(
        r#"{
            "name": "grid outage",
            "duration": 125.0,
            "steps": [
                { "at": 0.0, "operator": "initiate_startup" },
                { "at": 100.0, "inject": "grid_outage" },
                { "at": 110.0, "inject": "grid_restore" },
                { "at": 112.0, "operator": "resolve_all_emergencies" }
            ]
        }"#,
    )
    .await?;

    assert_eq!(report.stop_reason, StopReason::ScenarioComplete);
    assert_eq!(report.scenario.as_deref(), Some("grid outage"));
    assert!(report.states_visited.contains(&SystemState::EmergencyActive));
    assert_eq!(report.final_state, SystemState::Operational);
    assert_eq!(report.emergencies_triggered, 1);
    Ok(())
}

#[tokio::test]
async fn overspeed_trip_requires_reset_before_returning_offline() -> Result<()> {
    let report = run_scenario(
        r#"{
            "name": "overspeed",
            "duration": 125.0,
            "steps": [
                { "at": 0.0, "operator": "initiate_startup" },
                { "at": 100.0, "inject": "overspeed", "rpm": 520.0 },
                { "at": 110.0, "operator": "reset_interlocks" },
                { "at": 111.0, "operator": "resolve_all_emergencies" },
                { "at": 112.0, "operator": "operator_reset" }
            ]
        }"#,
    )
    .await?;

    assert!(report.states_visited.contains(&SystemState::Shutdown));
    assert!(report.states_visited.contains(&SystemState::Recovering));
    assert_eq!(report.final_state, SystemState::Offline);
    assert!(report.final_status.emergency.tripped_interlocks.is_empty());
    Ok(())
}

#[tokio::test]
async fn refused_operator_actions_do_not_stop_the_run() -> Result<()> {
    let report = run_scenario(
        r#"{
            "name": "premature reset",
            "duration": 5.0,
            "steps": [
                { "at": 1.0, "operator": "operator_reset" },
                { "at": 2.0, "operator": "abort_startup" }
            ]
        }"#,
    )
    .await?;

    assert_eq!(report.stop_reason, StopReason::ScenarioComplete);
    assert_eq!(report.final_state, SystemState::Offline);
    assert!(report.transitions.is_empty());
    Ok(())
}

#[tokio::test]
async fn manual_emergency_through_the_handle() -> Result<()> {
    let runtime = ControllerRuntime::spawn(TransientConfig::default(), None);
    let handle = runtime.handle();
    let id = handle
        .manual_emergency(EmergencySeverity::Warning, "operator drill")
        .await?;
    let status = handle.status().await?;
    assert_eq!(status.system_state, SystemState::EmergencyActive);
    assert_eq!(status.emergency.active.len(), 1);
    assert_eq!(status.emergency.active[0].id, id);

    let resolved = handle.resolve_emergency(id).await?;
    assert!(resolved.resolved);
    assert!(handle.resolve_emergency(id).await.is_err());
    assert_eq!(handle.status().await?.system_state, SystemState::Offline);
    assert!(!handle.reset_interlock(InterlockKind::Overspeed).await?);
    assert_eq!(handle.resolve_all_emergencies().await?, 0);
    runtime.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn realtime_run_stops_on_shutdown_signal() -> Result<()> {
    let transient = TransientConfig::default();
    let runtime = ControllerRuntime::spawn(transient.clone(), None);
    let plant_loop = PlantLoop::new(&SimulationConfig::default(), &transient, runtime.handle())?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let options = LoopOptions {
        realtime: true,
        ..LoopOptions::default()
    };
    let task = tokio::spawn(plant_loop.run(options, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown_tx.send(())?;
    let report = task.await??;

    assert_eq!(report.stop_reason, StopReason::Shutdown);
    assert!(report.ticks >= 1);
    assert_eq!(report.final_state, SystemState::Offline);
    runtime.shutdown().await?;
    Ok(())
}
