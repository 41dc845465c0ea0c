//! ---
//! kpp_section: "01-core-functionality"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Primary orchestration and lifecycle management."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use kpp_common::config::{SimulationConfig, TransientConfig};
use kpp_metrics::LoopMetrics;
use kpp_sim::{GridCondition, OperatorAction, PlantModel, ScenarioCursor, ScenarioEvent, ScenarioScript};
use kpp_transient::{
    ControllerStatus, CoordinatedCommands, EmergencyEvent, EmergencyId, EmergencySeverity,
    InterlockKind, StateTransition, SystemSnapshot, SystemState, TransientError,
    TransientEventController, TransientMetrics,
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONTROL_QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
enum ControlMessage {
    Tick {
        snapshot: Box<SystemSnapshot>,
        reply: oneshot::Sender<CoordinatedCommands>,
    },
    InitiateStartup {
        reply: oneshot::Sender<Result<(), TransientError>>,
    },
    AbortStartup {
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    ManualEmergency {
        severity: EmergencySeverity,
        message: String,
        reply: oneshot::Sender<EmergencyId>,
    },
    ResolveEmergency {
        id: EmergencyId,
        reply: oneshot::Sender<Result<EmergencyEvent, TransientError>>,
    },
    ResolveAllEmergencies {
        reply: oneshot::Sender<usize>,
    },
    ResetInterlock {
        kind: InterlockKind,
        reply: oneshot::Sender<bool>,
    },
    ResetInterlocks {
        reply: oneshot::Sender<usize>,
    },
    OperatorReset {
        reply: oneshot::Sender<Result<(), TransientError>>,
    },
    Status {
        reply: oneshot::Sender<ControllerStatus>,
    },
}

/// Owns the controller inside a task; every request is serialised through
/// its inbox, so ticks and operator actions never interleave.
struct ControllerActor {
    controller: TransientEventController,
    now: f64,
    latest: Arc<RwLock<Option<CoordinatedCommands>>>,
}

impl ControllerActor {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ControlMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(target: "kpp::core::actor", "controller actor shutdown signal received");
                    break;
                }
                message = inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }
        info!(
            target: "kpp::core::actor",
            state = %self.controller.state(),
            time = self.now,
            "controller actor stopped"
        );
    }

    fn handle(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Tick { snapshot, reply } => {
                // Operator actions are stamped with the latest sane plant time.
                if snapshot.time.is_finite() && snapshot.time > self.now {
                    self.now = snapshot.time;
                }
                let commands = self.controller.update(&snapshot, self.now);
                *self.latest.write() = Some(commands.clone());
                let _ = reply.send(commands);
            }
            ControlMessage::InitiateStartup { reply } => {
                let _ = reply.send(self.controller.initiate_startup(self.now));
            }
            ControlMessage::AbortStartup { reason, reply } => {
                let _ = reply.send(self.controller.abort_startup(&reason, self.now));
            }
            ControlMessage::ManualEmergency {
                severity,
                message,
                reply,
            } => {
                let id = self
                    .controller
                    .trigger_manual_emergency(severity, &message, self.now);
                let _ = reply.send(id);
            }
            ControlMessage::ResolveEmergency { id, reply } => {
                let _ = reply.send(self.controller.resolve_emergency(id, self.now));
            }
            ControlMessage::ResolveAllEmergencies { reply } => {
                let resolved = self.controller.resolve_all_emergencies(self.now);
                let _ = reply.send(resolved.len());
            }
            ControlMessage::ResetInterlock { kind, reply } => {
                let _ = reply.send(self.controller.reset_interlock(kind, self.now));
            }
            ControlMessage::ResetInterlocks { reply } => {
                let reset = self.controller.reset_all_interlocks(self.now);
                let _ = reply.send(reset.len());
            }
            ControlMessage::OperatorReset { reply } => {
                let _ = reply.send(self.controller.operator_reset(self.now));
            }
            ControlMessage::Status { reply } => {
                let _ = reply.send(self.controller.status(self.now));
            }
        }
    }
}

/// Cloneable front door to a running controller actor.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    sender: mpsc::Sender<ControlMessage>,
    latest: Arc<RwLock<Option<CoordinatedCommands>>>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlMessage,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("controller actor is not running"))?;
        response
            .await
            .context("controller actor dropped the request")
    }

    pub async fn tick(&self, snapshot: SystemSnapshot) -> Result<CoordinatedCommands> {
        self.request(|reply| ControlMessage::Tick {
            snapshot: Box::new(snapshot),
            reply,
        })
        .await
    }

    pub async fn initiate_startup(&self) -> Result<()> {
        self.request(|reply| ControlMessage::InitiateStartup { reply })
            .await??;
        Ok(())
    }

    pub async fn abort_startup(&self, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        self.request(|reply| ControlMessage::AbortStartup { reason, reply })
            .await
    }

    pub async fn manual_emergency(
        &self,
        severity: EmergencySeverity,
        message: impl Into<String>,
    ) -> Result<EmergencyId> {
        let message = message.into();
        self.request(|reply| ControlMessage::ManualEmergency {
            severity,
            message,
            reply,
        })
        .await
    }

    pub async fn resolve_emergency(&self, id: EmergencyId) -> Result<EmergencyEvent> {
        let event = self
            .request(|reply| ControlMessage::ResolveEmergency { id, reply })
            .await??;
        Ok(event)
    }

    /// Resolve every active emergency. Returns how many were resolved.
    pub async fn resolve_all_emergencies(&self) -> Result<usize> {
        self.request(|reply| ControlMessage::ResolveAllEmergencies { reply })
            .await
    }

    /// Reset one interlock. `false` when it was not tripped.
    pub async fn reset_interlock(&self, kind: InterlockKind) -> Result<bool> {
        self.request(|reply| ControlMessage::ResetInterlock { kind, reply })
            .await
    }

    /// Reset every tripped interlock. Returns how many were reset.
    pub async fn reset_all_interlocks(&self) -> Result<usize> {
        self.request(|reply| ControlMessage::ResetInterlocks { reply })
            .await
    }

    pub async fn operator_reset(&self) -> Result<()> {
        self.request(|reply| ControlMessage::OperatorReset { reply })
            .await??;
        Ok(())
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        self.request(|reply| ControlMessage::Status { reply }).await
    }

    /// Most recent tick result, without queueing behind pending requests.
    pub fn latest(&self) -> Option<CoordinatedCommands> {
        self.latest.read().clone()
    }
}

/// Running controller actor and the means to stop it.
#[derive(Debug)]
pub struct ControllerRuntime {
    handle: ControllerHandle,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ControllerRuntime {
    pub fn spawn(config: TransientConfig, metrics: Option<TransientMetrics>) -> Self {
        let (sender, inbox) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = broadcast::channel(4);
        let latest = Arc::new(RwLock::new(None));
        let actor = ControllerActor {
            controller: TransientEventController::new(config, metrics),
            now: 0.0,
            latest: latest.clone(),
        };
        let task = tokio::spawn(actor.run(inbox, shutdown_rx));
        info!(target: "kpp::core::actor", "controller actor started");
        Self {
            handle: ControllerHandle { sender, latest },
            shutdown,
            task,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .context("controller actor task failed to join")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TickLimit,
    ScenarioComplete,
    Shutdown,
}

/// How long and how fast a [`PlantLoop`] runs.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    pub max_ticks: Option<u64>,
    /// Pace ticks against the wall clock instead of running flat out.
    pub realtime: bool,
    /// Request a startup before the first tick.
    pub initiate_startup: bool,
}

/// Summary of a finished plant loop run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_reason: StopReason,
    pub ticks: u64,
    pub simulated_seconds: f64,
    pub final_state: SystemState,
    pub states_visited: Vec<SystemState>,
    pub transitions: Vec<StateTransition>,
    pub emergencies_triggered: u64,
    pub handler_faults: usize,
    pub final_status: ControllerStatus,
}

/// Closes the loop between the plant model and the controller actor, feeding
/// scenario events in as their time comes.
#[derive(Debug)]
pub struct PlantLoop {
    plant: PlantModel,
    controller: ControllerHandle,
    scenario: Option<(String, ScenarioCursor)>,
    duration: Option<f64>,
    tick_interval: Duration,
    metrics: Option<LoopMetrics>,
}

impl PlantLoop {
    pub fn new(
        simulation: &SimulationConfig,
        transient: &TransientConfig,
        controller: ControllerHandle,
    ) -> Result<Self> {
        simulation.validate()?;
        let grid = GridCondition::nominal(
            transient.plant.nominal_voltage_v,
            transient.plant.nominal_frequency_hz,
        );
        let plant = PlantModel::new(simulation, grid).context("failed to build plant model")?;
        Ok(Self {
            plant,
            controller,
            scenario: None,
            duration: None,
            tick_interval: simulation.tick_interval,
            metrics: None,
        })
    }

    pub fn with_scenario(mut self, script: &ScenarioScript) -> Self {
        self.duration = script.duration;
        self.scenario = Some((script.name.clone(), script.cursor()));
        self
    }

    pub fn with_metrics(mut self, metrics: LoopMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn plant(&self) -> &PlantModel {
        &self.plant
    }

    pub async fn run(
        mut self,
        options: LoopOptions,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<RunReport> {
        if options.max_ticks.is_none() && self.duration.is_none() && !options.realtime {
            return Err(anyhow!(
                "a run without a tick limit or scenario duration must be paced in real time"
            ));
        }
        let started_at = Utc::now();
        let dt = self.tick_interval.as_secs_f64();
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        if options.initiate_startup {
            self.operator(OperatorAction::InitiateStartup).await;
        }

        let mut snapshot = self.plant.snapshot();
        let mut ticks: u64 = 0;
        let mut handler_faults = 0usize;
        let mut states_visited: Vec<SystemState> = Vec::new();
        let stop_reason = loop {
            if options.max_ticks.is_some_and(|limit| ticks >= limit) {
                break StopReason::TickLimit;
            }
            if self
                .duration
                .is_some_and(|duration| self.plant.time() >= duration - dt / 2.0)
            {
                break StopReason::ScenarioComplete;
            }
            if options.realtime {
                tokio::select! {
                    _ = shutdown.recv() => break StopReason::Shutdown,
                    _ = interval.tick() => {}
                }
            } else {
                match shutdown.try_recv() {
                    Ok(()) | Err(TryRecvError::Lagged(_)) => break StopReason::Shutdown,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
                }
                tokio::task::yield_now().await;
            }

            let now = self.plant.time();
            let due = self
                .scenario
                .as_mut()
                .map(|(_, cursor)| cursor.due(now))
                .unwrap_or_default();
            for event in due {
                match event {
                    ScenarioEvent::Plant(injection) => self.plant.apply(&injection),
                    ScenarioEvent::Operator(action) => self.operator(action).await,
                }
            }

            let tick_started = Instant::now();
            let coordinated = self.controller.tick(snapshot).await?;
            if let Some(metrics) = &self.metrics {
                metrics.observe_tick(coordinated.primary_event_type.as_str(), tick_started.elapsed());
            }
            handler_faults += coordinated.handler_faults.len();
            if states_visited.last() != Some(&coordinated.system_state) {
                debug!(
                    target: "kpp::core::loop",
                    time = coordinated.time,
                    state = %coordinated.system_state,
                    primary = %coordinated.primary_event_type,
                    "system state changed"
                );
                states_visited.push(coordinated.system_state);
            }
            snapshot = self.plant.step(&coordinated.commands, dt);
            ticks += 1;
        };

        let final_status = self.controller.status().await?;
        let report = RunReport {
            scenario: self.scenario.as_ref().map(|(name, _)| name.clone()),
            started_at,
            finished_at: Utc::now(),
            stop_reason,
            ticks,
            simulated_seconds: self.plant.time(),
            final_state: final_status.system_state,
            states_visited,
            transitions: final_status.transitions.clone(),
            emergencies_triggered: final_status.emergency.total_triggered,
            handler_faults,
            final_status,
        };
        info!(
            target: "kpp::core::loop",
            ticks = report.ticks,
            simulated_seconds = report.simulated_seconds,
            final_state = %report.final_state,
            stop_reason = ?report.stop_reason,
            "plant loop finished"
        );
        Ok(report)
    }

    async fn operator(&self, action: OperatorAction) {
        info!(target: "kpp::core::loop", time = self.plant.time(), ?action, "operator action");
        let outcome = match &action {
            OperatorAction::InitiateStartup => self.controller.initiate_startup().await,
            OperatorAction::AbortStartup { reason } => {
                self.controller.abort_startup(reason.as_str()).await.map(|_| ())
            }
            OperatorAction::ManualEmergency { severity, message } => self
                .controller
                .manual_emergency(*severity, message.as_str())
                .await
                .map(|_| ()),
            OperatorAction::ResolveAllEmergencies => {
                self.controller.resolve_all_emergencies().await.map(|_| ())
            }
            OperatorAction::ResetInterlock { interlock } => {
                match self.controller.reset_interlock(*interlock).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(anyhow!("interlock {} was not tripped", interlock)),
                    Err(err) => Err(err),
                }
            }
            OperatorAction::ResetInterlocks => {
                self.controller.reset_all_interlocks().await.map(|_| ())
            }
            OperatorAction::OperatorReset => self.controller.operator_reset().await,
        };
        if let Err(err) = outcome {
            warn!(target: "kpp::core::loop", ?action, error = %err, "operator action refused");
        }
    }
}
