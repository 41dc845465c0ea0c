//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "tests"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Behavioural tests for the transient-event controller."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use kpp_common::config::{GridNominal, StartupConfig, TransientConfig};
use kpp_transient::emergency::EmergencyState;
use kpp_transient::grid::{DisturbanceSeverity, DisturbanceType, ResponseMode};
use kpp_transient::snapshot::FloaterReading;
use kpp_transient::{
    CommandSet, EmergencySeverity, EmergencyType, FaultKind, GridDisturbanceHandler, GridMeasurement,
    InterlockKind, PrimaryEventType, StartupPhase, StartupSequencer, SystemSnapshot, SystemState,
    TransientError, TransientEventController,
};

const STEP: f64 = 0.5;

/// Readings that satisfy every startup predicate at once.
fn ready_snapshot(time: f64) -> SystemSnapshot {
    ready_snapshot_on(time, 60.0)
}

fn ready_snapshot_on(time: f64, grid_frequency: f64) -> SystemSnapshot {
    let mut snapshot = SystemSnapshot::at_rest(time, 480.0, grid_frequency);
    snapshot.pneumatics.tank_pressure = 5.0;
    snapshot
        .component_temperatures
        .insert("generator".into(), 45.0);
    snapshot
        .component_temperatures
        .insert("compressor".into(), 52.0);
    snapshot.floaters = (0..8)
        .map(|id| FloaterReading {
            id,
            fill_progress: 0.5,
        })
        .collect();
    snapshot.flywheel_speed_rpm = 375.0;
    snapshot.chain_speed_rpm = 6.0;
    snapshot.torque = 900.0;
    snapshot.generator_current = 60.0;
    snapshot
}

fn controller() -> TransientEventController {
    TransientEventController::new(TransientConfig::default(), None)
}

fn assert_invariant(controller: &TransientEventController) {
    assert_eq!(
        controller.state() == SystemState::EmergencyActive,
        controller.emergency().has_active(),
        "state {} with {} active emergencies",
        controller.state(),
        controller.emergency().active().count()
    );
}

/// Run a full startup and return the next free timestamp.
fn drive_to_operational(controller: &mut TransientEventController) -> f64 {
    controller.initiate_startup(0.0).unwrap();
    let mut now = 0.0;
    while controller.state() != SystemState::Operational {
        assert!(now < 60.0, "startup did not complete: {}", controller.state());
        controller.update(&ready_snapshot(now), now);
        assert_invariant(controller);
        now += STEP;
    }
    now
}

#[test]
fn nominal_startup_reaches_operational() {
    let mut controller = controller();
    let now = drive_to_operational(&mut controller);
    assert!(now <= 5.0);
    assert_eq!(controller.startup().phase(), StartupPhase::Operational);

    let output = controller.update(&ready_snapshot(now), now);
    assert_eq!(output.primary_event_type, PrimaryEventType::None);
    assert_eq!(output.commands.electrical.grid_connect, Some(true));
    assert_eq!(output.commands.control.speed_setpoint, Some(375.0));

    let visited: Vec<SystemState> = controller.transitions().iter().map(|t| t.to).collect();
    assert_eq!(visited, vec![SystemState::Starting, SystemState::Operational]);
}

#[test]
fn emergency_state_tracks_active_events_through_a_mixed_sequence() {
    let mut controller = controller();
    let mut now = drive_to_operational(&mut controller);

    let drill = controller.trigger_manual_emergency(EmergencySeverity::Caution, "drill", now);
    assert_invariant(&controller);
    for _ in 0..4 {
        controller.update(&ready_snapshot(now), now);
        assert_invariant(&controller);
        now += STEP;
    }
    controller.resolve_emergency(drill, now).unwrap();
    assert_invariant(&controller);
    assert_eq!(controller.state(), SystemState::Operational);

    let mut overspeed = ready_snapshot(now);
    overspeed.flywheel_speed_rpm = 500.0;
    controller.update(&overspeed, now);
    assert_invariant(&controller);
    now += STEP;

    for _ in 0..4 {
        controller.update(&ready_snapshot(now), now);
        assert_invariant(&controller);
        now += STEP;
    }
    controller.resolve_all_emergencies(now);
    assert_invariant(&controller);
    assert_eq!(controller.state(), SystemState::Shutdown);

    assert_eq!(
        controller.resolve_emergency(drill, now),
        Err(TransientError::UnknownEmergency(drill))
    );
    assert_invariant(&controller);
}

#[test]
fn tripped_interlock_stays_latched_until_reset() {
    let mut controller = controller();
    let mut now = drive_to_operational(&mut controller);

    let mut overspeed = ready_snapshot(now);
    overspeed.flywheel_speed_rpm = 500.0;
    let output = controller.update(&overspeed, now);
    assert_eq!(output.emergency.newly_tripped, vec![InterlockKind::Overspeed]);
    now += STEP;

    for _ in 0..20 {
        let output = controller.update(&ready_snapshot(now), now);
        assert!(output.emergency.newly_tripped.is_empty());
        assert!(output
            .emergency
            .tripped_interlocks
            .contains(&InterlockKind::Overspeed));
        now += STEP;
    }
    assert_eq!(controller.emergency().active().count(), 1);

    controller.resolve_all_emergencies(now);
    assert_eq!(controller.state(), SystemState::Shutdown);
    assert_eq!(
        controller.operator_reset(now),
        Err(TransientError::InterlocksTripped(vec![InterlockKind::Overspeed]))
    );

    assert!(controller.reset_interlock(InterlockKind::Overspeed, now));
    assert!(controller.emergency().tripped_interlocks().is_empty());
    controller.operator_reset(now).unwrap();
    assert_eq!(controller.state(), SystemState::Recovering);

    controller.update(&ready_snapshot(now + 2.0), now + 2.0);
    assert_eq!(controller.state(), SystemState::Recovering);
    controller.update(&ready_snapshot(now + 5.0), now + 5.0);
    assert_eq!(controller.state(), SystemState::Offline);
}

#[test]
fn system_checks_timeout_fails_startup() {
    let mut sequencer = StartupSequencer::new(StartupConfig::default());
    let mut snapshot = ready_snapshot(0.0);
    snapshot.pneumatics.tank_pressure = 0.5;

    sequencer.initiate(0.0).unwrap();
    let mut now = 0.0;
    let mut last = sequencer.update(&snapshot.startup_inputs(), now);
    while now < 40.0 && !last.startup_failed {
        now += 1.0;
        last = sequencer.update(&snapshot.startup_inputs(), now);
    }

    // System checks begin at t=2 and expire strictly after 15 s.
    assert_eq!(now, 18.0);
    assert!(last.startup_failed);
    assert!(last.newly_failed);
    assert_eq!(last.current_phase, StartupPhase::Failed);
    assert_eq!(last.failure_kind, Some(FaultKind::SystemCheckFailure));
    assert!(last
        .failure_reason
        .as_deref()
        .is_some_and(|reason| reason.contains("tank pressure")));
    assert!(last.faults.iter().any(|fault| fault.check == "pneumatic_pressure"));
    let directives = last.emergency_commands.unwrap();
    assert!(directives.pneumatic_stop && directives.electrical_disconnect && directives.mechanical_brake);

    let later = sequencer.update(&snapshot.startup_inputs(), now + 1.0);
    assert!(later.startup_failed);
    assert!(!later.newly_failed);
    assert!(later.emergency_commands.is_some());
}

#[test]
fn overspeed_preempts_active_startup_on_the_same_tick() {
    let mut controller = controller();
    controller.initiate_startup(0.0).unwrap();
    controller.update(&ready_snapshot(0.0), 0.0);
    controller.update(&ready_snapshot(0.5), 0.5);
    assert!(controller.startup().is_active());

    let mut overspeed = ready_snapshot(1.0);
    overspeed.flywheel_speed_rpm = 500.0;
    let output = controller.update(&overspeed, 1.0);

    assert_eq!(output.primary_event_type, PrimaryEventType::Emergency);
    assert_eq!(output.system_state, SystemState::EmergencyActive);
    let event = controller.emergency().active().next().unwrap();
    assert_eq!(event.kind, EmergencyType::SafetyViolation);
    assert_eq!(event.severity, EmergencySeverity::Critical);
    assert!(!controller.startup().is_active());
    assert!(output.startup.newly_failed);
    assert_eq!(output.commands.mechanical.mechanical_brake, Some(true));
    assert_eq!(output.commands.electrical.grid_connect, Some(false));
    assert!(output.emergency_directives.pneumatic_stop);
}

#[test]
fn voltage_sag_severity_drives_response_mode() {
    let mut handler = GridDisturbanceHandler::new(Default::default());
    handler.monitor(&GridMeasurement::nominal(60.0, 430.0), 0.0);
    let sag = handler.active_event(DisturbanceType::VoltageDrop).unwrap();
    assert!(sag.severity >= DisturbanceSeverity::Moderate);
    let response = handler.execute_response(0.0);
    assert_eq!(response.response_mode, ResponseMode::VoltageSupport);
    assert!(response.commands.electrical.reactive_power_adjustment_pct.unwrap() > 0.0);

    handler.monitor(&GridMeasurement::nominal(60.0, 380.0), 1.0);
    let response = handler.execute_response(1.0);
    assert!(response.response_mode >= ResponseMode::LoadShedding);
    assert!(response.commands.electrical.load_shed_fraction.unwrap() > 0.0);
    let sag = handler.active_event(DisturbanceType::VoltageDrop).unwrap();
    assert_eq!(sag.severity, DisturbanceSeverity::Critical);
}

#[test]
fn grid_support_drives_an_operational_plant_only() {
    let mut controller = controller();
    controller.initiate_startup(0.0).unwrap();
    let mut sag = ready_snapshot(0.0);
    sag.grid_voltage = 430.0;
    let output = controller.update(&sag, 0.0);
    assert_eq!(output.primary_event_type, PrimaryEventType::Startup);
    assert!(output.grid_commands_informational);
    assert!(output.commands.electrical.reactive_power_adjustment_pct.is_none());

    let mut controller = self::controller();
    let now = drive_to_operational(&mut controller);
    let mut sag = ready_snapshot(now);
    sag.grid_voltage = 430.0;
    let output = controller.update(&sag, now);
    assert_eq!(output.primary_event_type, PrimaryEventType::GridSupport);
    assert!(!output.grid_commands_informational);
    assert!(output.commands.electrical.reactive_power_adjustment_pct.unwrap() > 0.0);
    assert_eq!(output.system_state, SystemState::Operational);
}

#[test]
fn resolving_all_emergencies_returns_to_operational() {
    let mut controller = controller();
    let now = drive_to_operational(&mut controller);
    controller.trigger_manual_emergency(EmergencySeverity::Warning, "inspection", now);
    controller.trigger_emergency(
        EmergencyType::Environmental,
        EmergencySeverity::Caution,
        "wind gusts",
        Default::default(),
        now,
    );
    assert_eq!(controller.state(), SystemState::EmergencyActive);

    let resolved = controller.resolve_all_emergencies(now + 3.0);
    assert_eq!(resolved.len(), 2);
    assert_eq!(controller.emergency().state(), EmergencyState::Normal);
    assert_eq!(controller.state(), SystemState::Operational);
    assert!((controller.emergency().mean_response_time() - 3.0).abs() < 1e-9);
}

#[test]
fn resolving_all_emergencies_returns_to_starting() {
    let mut controller = controller();
    controller.initiate_startup(0.0).unwrap();
    controller.update(&ready_snapshot(0.0), 0.0);
    controller.trigger_manual_emergency(EmergencySeverity::Caution, "visitor on site", 0.5);
    let output = controller.update(&ready_snapshot(0.5), 0.5);
    assert_eq!(output.primary_event_type, PrimaryEventType::Emergency);
    assert!(controller.startup().is_active());

    assert_ne!(output.commands, output.startup_commands);
    assert_eq!(output.commands, CommandSet::idle_hold());

    controller.resolve_all_emergencies(1.0);
    assert_eq!(controller.state(), SystemState::Starting);
    assert_eq!(controller.emergency().state(), EmergencyState::Normal);
}

#[test]
fn emergency_during_operation_holds_the_operating_point() {
    let mut controller = controller();
    let now = drive_to_operational(&mut controller);
    controller.trigger_manual_emergency(EmergencySeverity::Caution, "drill", now);
    let output = controller.update(&ready_snapshot(now), now);
    assert_eq!(output.system_state, SystemState::EmergencyActive);
    assert_eq!(output.commands.electrical.grid_connect, Some(true));
    assert_eq!(output.commands.control.speed_setpoint, Some(375.0));
}

#[test]
fn fifty_hertz_plant_starts_without_tripping() {
    let config = TransientConfig::default().with_plant_nominal(GridNominal::new(50.0, 480.0));
    let mut controller = TransientEventController::new(config, None);

    let output = controller.update(&SystemSnapshot::at_rest(0.0, 480.0, 50.0), 0.0);
    assert_eq!(output.system_state, SystemState::Offline);
    assert!(controller.emergency().tripped_interlocks().is_empty());

    controller.initiate_startup(0.5).unwrap();
    let mut now = 0.5;
    while controller.state() != SystemState::Operational {
        assert!(now < 60.0, "startup did not complete: {}", controller.state());
        let output = controller.update(&ready_snapshot_on(now, 50.0), now);
        assert_ne!(output.primary_event_type, PrimaryEventType::Emergency);
        now += STEP;
    }
    assert!(!controller.emergency().has_active());
    assert!(!controller.grid().has_active());
    assert_eq!(controller.emergency().history().len(), 0);
}

#[test]
fn abort_on_inactive_sequencer_is_a_no_op() {
    let mut sequencer = StartupSequencer::new(StartupConfig::default());
    let before = (sequencer.phase(), sequencer.sync_attempts(), sequencer.faults().len());
    assert!(!sequencer.abort("operator", 1.0));
    assert!(!sequencer.abort("operator", 2.0));
    assert_eq!(
        (sequencer.phase(), sequencer.sync_attempts(), sequencer.faults().len()),
        before
    );
    assert!(sequencer.failure().is_none());

    let mut controller = controller();
    assert!(!controller.abort_startup("operator", 0.0));
    assert_eq!(controller.state(), SystemState::Offline);
    assert!(controller.transitions().is_empty());
}

#[test]
fn operator_abort_goes_to_shutdown_without_an_emergency() {
    let mut controller = controller();
    controller.initiate_startup(0.0).unwrap();
    controller.update(&ready_snapshot(0.0), 0.0);
    assert!(controller.abort_startup("wrong valve lineup", 0.5));
    assert!(!controller.abort_startup("wrong valve lineup", 0.6));
    assert_eq!(controller.state(), SystemState::Shutdown);

    let output = controller.update(&ready_snapshot(1.0), 1.0);
    assert!(!controller.emergency().has_active());
    assert_eq!(output.startup.failure_kind, Some(FaultKind::Aborted));
    assert_eq!(output.commands.mechanical.mechanical_brake, Some(true));

    assert_eq!(
        controller.initiate_startup(1.5),
        Err(TransientError::StartupNotPermitted(SystemState::Shutdown))
    );
}

#[test]
fn synchronisation_exhaustion_escalates_to_gradual_shutdown() {
    let mut controller = controller();
    controller.initiate_startup(0.0).unwrap();
    let mut now = 0.0;
    let mut failed = None;
    while now < 60.0 {
        let mut snapshot = ready_snapshot(now);
        // Fast enough to finish accelerating, too slow to match 60 Hz.
        snapshot.flywheel_speed_rpm = 360.0;
        let output = controller.update(&snapshot, now);
        if output.startup.newly_failed {
            failed = Some(output);
            break;
        }
        now += STEP;
    }

    let output = failed.expect("synchronisation should exhaust its retries");
    assert_eq!(output.startup.failure_kind, Some(FaultKind::SynchronizationExhausted));
    assert_eq!(output.startup.sync_attempts, 4);
    assert_eq!(output.system_state, SystemState::EmergencyActive);
    let event = controller.emergency().active().next().unwrap();
    assert_eq!(event.kind, EmergencyType::Control);
    assert_eq!(event.severity, EmergencySeverity::Danger);
    assert!(controller.emergency().plant_stopped());

    controller.resolve_all_emergencies(now + 1.0);
    assert_eq!(controller.state(), SystemState::Shutdown);
}

#[test]
fn grid_outage_isolates_once_and_recovers_to_operational() {
    let mut controller = controller();
    let mut now = drive_to_operational(&mut controller);

    for _ in 0..5 {
        let mut outage = ready_snapshot(now);
        outage.grid_connected = false;
        outage.grid_voltage = 0.0;
        let output = controller.update(&outage, now);
        assert_eq!(output.primary_event_type, PrimaryEventType::Emergency);
        assert_eq!(output.commands.electrical.grid_connect, Some(false));
        assert_eq!(output.commands.control.islanded_mode, Some(true));
        assert_eq!(output.commands.electrical.generator_enable, Some(true));
        now += STEP;
    }
    let grid_events: Vec<_> = controller
        .emergency()
        .active()
        .filter(|event| event.kind == EmergencyType::Grid)
        .collect();
    assert_eq!(grid_events.len(), 1);
    assert!(!controller.emergency().plant_stopped());

    controller.update(&ready_snapshot(now), now);
    controller.resolve_all_emergencies(now);
    assert_eq!(controller.state(), SystemState::Operational);
    assert!(controller.emergency().shutdown().is_none());
}

#[test]
fn invalid_snapshot_is_contained_as_a_control_emergency() {
    let mut controller = controller();
    let now = drive_to_operational(&mut controller);
    let mut broken = ready_snapshot(now);
    broken.grid_frequency = f64::NAN;

    let output = controller.update(&broken, now);
    assert_eq!(output.handler_faults.len(), 1);
    assert_eq!(output.primary_event_type, PrimaryEventType::Emergency);
    controller.update(&broken, now + STEP);
    assert_eq!(controller.emergency().active().count(), 1);
    let event = controller.emergency().active().next().unwrap();
    assert_eq!(event.kind, EmergencyType::Control);
    assert_eq!(controller.status(now).handler_faults, 1);
}
