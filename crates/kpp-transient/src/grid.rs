//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Grid disturbance classification and support responses.
//!
//! Disturbances are classified against percentage tables relative to nominal
//! grid values. At most one event per disturbance type is active; resolution
//! is polled on every [`GridDisturbanceHandler::monitor`] call against each
//! active event's current magnitude. A drop or rise that reverses direction
//! keeps its event, and while an oscillation of the same quantity is active
//! the directional event is held and its response left to damping control.

use std::collections::VecDeque;
use std::fmt;

use indexmap::IndexMap;
use kpp_common::config::{GridDisturbanceConfig, SeverityThresholds};
use kpp_common::time::{elapsed, has_expired, SimSeconds};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commands::{CommandSet, ControlCommands, ElectricalCommands};
use crate::error::FaultKind;
use crate::history::BoundedHistory;
use crate::metrics::TransientMetrics;
use crate::snapshot::GridMeasurement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisturbanceType {
    FrequencyDrop,
    FrequencyRise,
    VoltageDrop,
    VoltageRise,
    FrequencyOscillation,
    VoltageOscillation,
    PowerQuality,
    GridFault,
}

impl DisturbanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisturbanceType::FrequencyDrop => "frequency_drop",
            DisturbanceType::FrequencyRise => "frequency_rise",
            DisturbanceType::VoltageDrop => "voltage_drop",
            DisturbanceType::VoltageRise => "voltage_rise",
            DisturbanceType::FrequencyOscillation => "frequency_oscillation",
            DisturbanceType::VoltageOscillation => "voltage_oscillation",
            DisturbanceType::PowerQuality => "power_quality",
            DisturbanceType::GridFault => "grid_fault",
        }
    }

    /// The same quantity deviating the other way.
    fn opposite(&self) -> Option<DisturbanceType> {
        match self {
            DisturbanceType::FrequencyDrop => Some(DisturbanceType::FrequencyRise),
            DisturbanceType::FrequencyRise => Some(DisturbanceType::FrequencyDrop),
            DisturbanceType::VoltageDrop => Some(DisturbanceType::VoltageRise),
            DisturbanceType::VoltageRise => Some(DisturbanceType::VoltageDrop),
            _ => None,
        }
    }

    /// Oscillation type that supersedes this directional type.
    fn oscillation(&self) -> Option<DisturbanceType> {
        match self {
            DisturbanceType::FrequencyDrop | DisturbanceType::FrequencyRise => {
                Some(DisturbanceType::FrequencyOscillation)
            }
            DisturbanceType::VoltageDrop | DisturbanceType::VoltageRise => {
                Some(DisturbanceType::VoltageOscillation)
            }
            _ => None,
        }
    }

    fn support_mode(&self) -> ResponseMode {
        match self {
            DisturbanceType::FrequencyDrop
            | DisturbanceType::FrequencyRise
            | DisturbanceType::FrequencyOscillation => ResponseMode::FrequencySupport,
            DisturbanceType::VoltageDrop
            | DisturbanceType::VoltageRise
            | DisturbanceType::VoltageOscillation => ResponseMode::VoltageSupport,
            DisturbanceType::PowerQuality => ResponseMode::Normal,
            DisturbanceType::GridFault => ResponseMode::Disconnect,
        }
    }
}

impl fmt::Display for DisturbanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisturbanceSeverity {
    Minor,
    Moderate,
    Major,
    Critical,
}

impl DisturbanceSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisturbanceSeverity::Minor => "minor",
            DisturbanceSeverity::Moderate => "moderate",
            DisturbanceSeverity::Major => "major",
            DisturbanceSeverity::Critical => "critical",
        }
    }

    /// Classify a percentage deviation. Below the minor threshold is not a
    /// disturbance.
    pub fn classify(value: f64, table: &SeverityThresholds) -> Option<Self> {
        if value >= table.critical {
            Some(DisturbanceSeverity::Critical)
        } else if value >= table.major {
            Some(DisturbanceSeverity::Major)
        } else if value >= table.moderate {
            Some(DisturbanceSeverity::Moderate)
        } else if value >= table.minor {
            Some(DisturbanceSeverity::Minor)
        } else {
            None
        }
    }
}

impl fmt::Display for DisturbanceSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Recovered,
    TimedOut,
}

impl ResolutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionOutcome::Recovered => "recovered",
            ResolutionOutcome::TimedOut => "timed_out",
        }
    }
}

/// Grid support posture, declared in escalation order. Frequency support
/// outranks voltage support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Normal,
    VoltageSupport,
    FrequencySupport,
    LoadShedding,
    Disconnect,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Normal => "normal",
            ResponseMode::VoltageSupport => "voltage_support",
            ResponseMode::FrequencySupport => "frequency_support",
            ResponseMode::LoadShedding => "load_shedding",
            ResponseMode::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisturbanceEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: DisturbanceType,
    pub severity: DisturbanceSeverity,
    /// Current deviation in percent.
    pub magnitude: f64,
    pub peak_magnitude: f64,
    pub start_time: SimSeconds,
    pub last_update: SimSeconds,
    pub resolved: bool,
    pub duration: Option<f64>,
    pub outcome: Option<ResolutionOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResponseAction {
    IncreaseActivePower { percent: f64 },
    DecreaseActivePower { percent: f64 },
    IncreaseReactivePower { percent: f64 },
    DecreaseReactivePower { percent: f64 },
    DampingControl { gain: f64 },
    HarmonicFiltering,
    EmergencyDisconnect,
}

/// Response dispatched for one active disturbance type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisturbanceResponse {
    pub event_id: u64,
    pub kind: DisturbanceType,
    pub severity: DisturbanceSeverity,
    #[serde(flatten)]
    pub action: ResponseAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridResponse {
    pub response_mode: ResponseMode,
    pub disconnect_required: bool,
    /// Grid fault event demanding the disconnect, when one does.
    pub disconnect_event: Option<u64>,
    pub active_count: usize,
    pub responses: Vec<DisturbanceResponse>,
    pub commands: CommandSet,
}

impl GridResponse {
    /// A response with no active disturbances.
    pub fn idle() -> Self {
        Self {
            response_mode: ResponseMode::Normal,
            disconnect_required: false,
            disconnect_event: None,
            active_count: 0,
            responses: Vec::new(),
            commands: CommandSet::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GridStatus {
    pub response_mode: ResponseMode,
    pub active: Vec<DisturbanceEvent>,
    pub total_detected: u64,
    pub history_len: usize,
    pub recovered: u64,
    pub timed_out: u64,
    pub last_measurement: Option<GridMeasurement>,
}

/// Sliding window over a measured quantity for oscillation detection.
#[derive(Debug, Clone)]
struct OscillationWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl OscillationWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn clear(&mut self) {
        self.samples.clear();
    }

    /// Peak-to-peak swing in percent of `nominal`, provided the window is full
    /// and the signal crosses its mean at least `min_crossings` times.
    fn swing_percent(&self, nominal: f64, min_crossings: usize) -> Option<f64> {
        if self.mean_crossings() < min_crossings {
            return None;
        }
        self.peak_to_peak_percent(nominal)
    }

    fn mean_crossings(&self) -> usize {
        if self.samples.is_empty() {
            return 0;
        }
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter(|(a, b)| (**a - mean).signum() * (**b - mean).signum() < 0.0)
            .count()
    }

    /// Peak-to-peak swing in percent of `nominal` over a full window.
    fn peak_to_peak_percent(&self, nominal: f64) -> Option<f64> {
        if self.samples.len() < self.capacity {
            return None;
        }
        let (low, high) = self
            .samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        Some((high - low) / nominal * 100.0)
    }
}

/// Classifies grid measurements and issues support responses.
#[derive(Debug)]
pub struct GridDisturbanceHandler {
    config: GridDisturbanceConfig,
    next_id: u64,
    active: IndexMap<DisturbanceType, DisturbanceEvent>,
    history: BoundedHistory<DisturbanceEvent>,
    frequency_window: OscillationWindow,
    voltage_window: OscillationWindow,
    last_measurement: Option<GridMeasurement>,
    response_mode: ResponseMode,
    recovered: u64,
    timed_out: u64,
    metrics: Option<TransientMetrics>,
}

impl GridDisturbanceHandler {
    pub fn new(config: GridDisturbanceConfig) -> Self {
        let history = BoundedHistory::new(config.history_capacity);
        let frequency_window = OscillationWindow::new(config.oscillation_window);
        let voltage_window = OscillationWindow::new(config.oscillation_window);
        Self {
            config,
            next_id: 1,
            active: IndexMap::new(),
            history,
            frequency_window,
            voltage_window,
            last_measurement: None,
            response_mode: ResponseMode::Normal,
            recovered: 0,
            timed_out: 0,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<TransientMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &DisturbanceEvent> {
        self.active.values()
    }

    pub fn active_event(&self, kind: DisturbanceType) -> Option<&DisturbanceEvent> {
        self.active.get(&kind)
    }

    pub fn history(&self) -> &BoundedHistory<DisturbanceEvent> {
        &self.history
    }

    pub fn response_mode(&self) -> ResponseMode {
        self.response_mode
    }

    /// Classify one measurement, update active events and poll resolution.
    /// Returns true when any disturbance is active afterwards.
    pub fn monitor(&mut self, measurement: &GridMeasurement, now: SimSeconds) -> bool {
        if measurement.connected {
            self.frequency_window.push(measurement.frequency_hz);
            self.voltage_window.push(measurement.voltage_v);
        } else {
            self.frequency_window.clear();
            self.voltage_window.clear();
        }

        let detections = self.detect(measurement);
        for (kind, severity, magnitude) in &detections {
            self.register(*kind, *severity, *magnitude, now);
        }

        let timeout = self.config.response_timeout;
        let mut lapsed = Vec::new();
        let kinds: Vec<DisturbanceType> = self.active.keys().copied().collect();
        for kind in kinds {
            let detected = detections.iter().any(|(detected, _, _)| *detected == kind);
            let held = self.is_held(kind);
            let level = if detected {
                None
            } else {
                self.current_level(kind, measurement)
            };
            let Some(event) = self.active.get_mut(&kind) else {
                continue;
            };
            if has_expired(event.start_time, now, timeout) {
                lapsed.push((kind, ResolutionOutcome::TimedOut));
                continue;
            }
            let Some((magnitude, severity)) = level else {
                continue;
            };
            event.magnitude = magnitude;
            event.peak_magnitude = event.peak_magnitude.max(magnitude);
            event.last_update = now;
            match severity {
                Some(severity) if severity > event.severity => {
                    warn!(
                        target: "kpp::transient::grid",
                        id = event.id,
                        kind = %kind,
                        from = %event.severity,
                        to = %severity,
                        magnitude,
                        "disturbance escalated"
                    );
                    event.severity = severity;
                }
                Some(_) => {}
                None if held => {}
                None => lapsed.push((kind, ResolutionOutcome::Recovered)),
            }
        }
        for (kind, outcome) in lapsed {
            self.resolve(kind, outcome, now);
        }

        self.last_measurement = Some(*measurement);
        !self.active.is_empty()
    }

    /// Every disturbance present in `measurement` with its severity and
    /// magnitude in percent.
    pub fn detect(
        &self,
        measurement: &GridMeasurement,
    ) -> Vec<(DisturbanceType, DisturbanceSeverity, f64)> {
        let config = &self.config;
        let tables = &config.tables;
        let frequency_deviation = self.frequency_deviation(measurement);
        let voltage_deviation = self.voltage_deviation(measurement);

        let (fault_magnitude, faulted) = self.fault_level(measurement);
        if faulted {
            return vec![(
                DisturbanceType::GridFault,
                DisturbanceSeverity::Critical,
                fault_magnitude,
            )];
        }

        let mut detections = Vec::new();
        let frequency_settled = !self.active.contains_key(&DisturbanceType::FrequencyOscillation);
        let voltage_settled = !self.active.contains_key(&DisturbanceType::VoltageOscillation);
        if let Some(severity) = DisturbanceSeverity::classify(frequency_deviation, &tables.frequency)
            .filter(|_| frequency_settled)
        {
            let kind = if measurement.frequency_hz < config.nominal.nominal_frequency_hz {
                DisturbanceType::FrequencyDrop
            } else {
                DisturbanceType::FrequencyRise
            };
            detections.push((kind, severity, frequency_deviation));
        }
        if let Some(severity) = DisturbanceSeverity::classify(voltage_deviation, &tables.voltage)
            .filter(|_| voltage_settled)
        {
            let kind = if measurement.voltage_v < config.nominal.nominal_voltage_v {
                DisturbanceType::VoltageDrop
            } else {
                DisturbanceType::VoltageRise
            };
            detections.push((kind, severity, voltage_deviation));
        }

        let min_crossings = config.oscillation_min_crossings;
        if let Some(swing) = self
            .frequency_window
            .swing_percent(config.nominal.nominal_frequency_hz, min_crossings)
        {
            if let Some(severity) = DisturbanceSeverity::classify(swing, &tables.frequency_oscillation) {
                detections.push((DisturbanceType::FrequencyOscillation, severity, swing));
            }
        }
        if let Some(swing) = self
            .voltage_window
            .swing_percent(config.nominal.nominal_voltage_v, min_crossings)
        {
            if let Some(severity) = DisturbanceSeverity::classify(swing, &tables.voltage_oscillation) {
                detections.push((DisturbanceType::VoltageOscillation, severity, swing));
            }
        }

        if let (magnitude, Some(severity)) = self.power_quality(measurement) {
            detections.push((DisturbanceType::PowerQuality, severity, magnitude));
        }
        detections
    }

    fn frequency_deviation(&self, measurement: &GridMeasurement) -> f64 {
        let nominal = self.config.nominal.nominal_frequency_hz;
        (measurement.frequency_hz - nominal).abs() / nominal * 100.0
    }

    fn voltage_deviation(&self, measurement: &GridMeasurement) -> f64 {
        let nominal = self.config.nominal.nominal_voltage_v;
        (measurement.voltage_v - nominal).abs() / nominal * 100.0
    }

    /// Fault magnitude in percent and whether the grid is faulted.
    fn fault_level(&self, measurement: &GridMeasurement) -> (f64, bool) {
        if !measurement.connected {
            return (100.0, true);
        }
        let frequency = self.frequency_deviation(measurement);
        let voltage = self.voltage_deviation(measurement);
        let faulted = voltage >= self.config.fault_voltage_deviation_pct
            || frequency >= self.config.fault_frequency_deviation_pct;
        (voltage.max(frequency), faulted)
    }

    /// Worst of harmonic distortion and power-factor deficit.
    fn power_quality(&self, measurement: &GridMeasurement) -> (f64, Option<DisturbanceSeverity>) {
        let tables = &self.config.tables;
        let thd = measurement.thd_percent;
        let pf_deficit = ((1.0 - measurement.power_factor.abs()) * 100.0).max(0.0);
        let worst = [
            DisturbanceSeverity::classify(thd, &tables.harmonic_distortion).map(|severity| (severity, thd)),
            DisturbanceSeverity::classify(pf_deficit, &tables.power_factor_deficit)
                .map(|severity| (severity, pf_deficit)),
        ]
        .into_iter()
        .flatten()
        .max_by(|a, b| a.0.cmp(&b.0));
        match worst {
            Some((severity, magnitude)) => (magnitude, Some(severity)),
            None => (thd.max(pf_deficit), None),
        }
    }

    /// Current magnitude of an active event's quantity and the severity it
    /// classifies to, `None` severity meaning below minor. Returns `None`
    /// when the quantity cannot be measured on this tick.
    fn current_level(
        &self,
        kind: DisturbanceType,
        measurement: &GridMeasurement,
    ) -> Option<(f64, Option<DisturbanceSeverity>)> {
        let tables = &self.config.tables;
        let nominal = self.config.nominal;
        if kind == DisturbanceType::GridFault {
            let (magnitude, faulted) = self.fault_level(measurement);
            return Some((magnitude, faulted.then_some(DisturbanceSeverity::Critical)));
        }
        if !measurement.connected {
            return None;
        }
        let (magnitude, table) = match kind {
            DisturbanceType::FrequencyDrop | DisturbanceType::FrequencyRise => {
                (self.frequency_deviation(measurement), &tables.frequency)
            }
            DisturbanceType::VoltageDrop | DisturbanceType::VoltageRise => {
                (self.voltage_deviation(measurement), &tables.voltage)
            }
            DisturbanceType::FrequencyOscillation => (
                self.frequency_window
                    .peak_to_peak_percent(nominal.nominal_frequency_hz)?,
                &tables.frequency_oscillation,
            ),
            DisturbanceType::VoltageOscillation => (
                self.voltage_window
                    .peak_to_peak_percent(nominal.nominal_voltage_v)?,
                &tables.voltage_oscillation,
            ),
            DisturbanceType::PowerQuality => return Some(self.power_quality(measurement)),
            DisturbanceType::GridFault => return None,
        };
        Some((magnitude, DisturbanceSeverity::classify(magnitude, table)))
    }

    /// Directional events are held while an oscillation of the same quantity
    /// is active.
    fn is_held(&self, kind: DisturbanceType) -> bool {
        kind.oscillation()
            .is_some_and(|oscillation| self.active.contains_key(&oscillation))
    }

    fn register(
        &mut self,
        kind: DisturbanceType,
        severity: DisturbanceSeverity,
        magnitude: f64,
        now: SimSeconds,
    ) {
        if let Some(opposite) = kind.opposite() {
            if let Some(mut event) = self.active.shift_remove(&opposite) {
                debug!(
                    target: "kpp::transient::grid",
                    id = event.id,
                    from = %opposite,
                    to = %kind,
                    "disturbance reversed direction"
                );
                event.kind = kind;
                self.active.insert(kind, event);
            }
        }
        if let Some(event) = self.active.get_mut(&kind) {
            event.magnitude = magnitude;
            event.peak_magnitude = event.peak_magnitude.max(magnitude);
            event.last_update = now;
            if severity > event.severity {
                warn!(
                    target: "kpp::transient::grid",
                    id = event.id,
                    kind = %kind,
                    from = %event.severity,
                    to = %severity,
                    magnitude,
                    "disturbance escalated"
                );
                event.severity = severity;
            }
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        warn!(
            target: "kpp::transient::grid",
            id,
            kind = %kind,
            %severity,
            magnitude,
            fault = %FaultKind::DisturbanceDetected,
            "grid disturbance detected"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_disturbance(kind.as_str(), severity.as_str());
        }
        self.active.insert(
            kind,
            DisturbanceEvent {
                id,
                kind,
                severity,
                magnitude,
                peak_magnitude: magnitude,
                start_time: now,
                last_update: now,
                resolved: false,
                duration: None,
                outcome: None,
            },
        );
    }

    fn resolve(&mut self, kind: DisturbanceType, outcome: ResolutionOutcome, now: SimSeconds) {
        let Some(mut event) = self.active.shift_remove(&kind) else {
            return;
        };
        let duration = elapsed(event.start_time, now).as_secs_f64();
        event.resolved = true;
        event.duration = Some(duration);
        event.outcome = Some(outcome);
        match outcome {
            ResolutionOutcome::TimedOut => {
                self.timed_out += 1;
                warn!(
                    target: "kpp::transient::grid",
                    id = event.id,
                    kind = %kind,
                    duration,
                    peak = event.peak_magnitude,
                    fault = %FaultKind::UnresolvedDisturbanceTimeout,
                    "disturbance unresolved within response timeout"
                );
            }
            ResolutionOutcome::Recovered => {
                self.recovered += 1;
                info!(
                    target: "kpp::transient::grid",
                    id = event.id,
                    kind = %kind,
                    duration,
                    peak = event.peak_magnitude,
                    "disturbance recovered"
                );
            }
        }
        debug!(
            target: "kpp::transient::grid",
            kind = %kind,
            procedure = recovery_procedure(kind),
            "disturbance recovery procedure"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_disturbance_resolution(kind.as_str(), outcome.as_str());
        }
        self.history.push(event);
    }

    /// Dispatch one response per active disturbance type and derive the
    /// overall response mode.
    pub fn execute_response(&mut self, now: SimSeconds) -> GridResponse {
        let mut events: Vec<&DisturbanceEvent> = self.active.values().collect();
        events.sort_by_key(|event| event.kind);

        let mut mode = ResponseMode::Normal;
        let mut disconnect_event = None;
        let mut shed_fraction: Option<f64> = None;
        let mut commands = CommandSet::default();
        let mut responses = Vec::with_capacity(events.len());

        let active_count = events.len();
        for event in events {
            if self.is_held(event.kind) {
                continue;
            }
            let action = self.action_for(event);
            commands.overlay(&action_commands(&action));

            let event_mode = if event.kind == DisturbanceType::GridFault {
                if event.severity == DisturbanceSeverity::Critical {
                    disconnect_event = Some(event.id);
                    ResponseMode::Disconnect
                } else {
                    ResponseMode::LoadShedding
                }
            } else if event.severity >= DisturbanceSeverity::Major {
                let fraction = load_shed_fraction(event.severity);
                shed_fraction = Some(shed_fraction.map_or(fraction, |f| f.max(fraction)));
                ResponseMode::LoadShedding
            } else {
                event.kind.support_mode()
            };
            mode = mode.max(event_mode);

            responses.push(DisturbanceResponse {
                event_id: event.id,
                kind: event.kind,
                severity: event.severity,
                action,
            });
        }

        if let Some(fraction) = shed_fraction {
            commands.electrical.load_shed_fraction = Some(fraction);
        }
        if mode != self.response_mode {
            info!(
                target: "kpp::transient::grid",
                from = %self.response_mode,
                to = %mode,
                active = responses.len(),
                now,
                "grid response mode changed"
            );
            self.response_mode = mode;
        }

        GridResponse {
            response_mode: mode,
            disconnect_required: mode == ResponseMode::Disconnect,
            disconnect_event,
            active_count,
            responses,
            commands,
        }
    }

    fn action_for(&self, event: &DisturbanceEvent) -> ResponseAction {
        let config = &self.config;
        let power = (config.frequency_droop_gain * event.magnitude).min(config.max_power_adjustment_pct);
        let reactive =
            (config.reactive_gain * event.magnitude).min(config.max_reactive_adjustment_pct);
        match event.kind {
            DisturbanceType::FrequencyDrop => ResponseAction::IncreaseActivePower { percent: power },
            DisturbanceType::FrequencyRise => ResponseAction::DecreaseActivePower { percent: power },
            DisturbanceType::VoltageDrop => ResponseAction::IncreaseReactivePower { percent: reactive },
            DisturbanceType::VoltageRise => ResponseAction::DecreaseReactivePower { percent: reactive },
            DisturbanceType::FrequencyOscillation => ResponseAction::DampingControl {
                gain: damping_gain(event.peak_magnitude, &config.tables.frequency_oscillation),
            },
            DisturbanceType::VoltageOscillation => ResponseAction::DampingControl {
                gain: damping_gain(event.peak_magnitude, &config.tables.voltage_oscillation),
            },
            DisturbanceType::PowerQuality => ResponseAction::HarmonicFiltering,
            DisturbanceType::GridFault => ResponseAction::EmergencyDisconnect,
        }
    }

    pub fn status(&self) -> GridStatus {
        GridStatus {
            response_mode: self.response_mode,
            active: self.active.values().cloned().collect(),
            total_detected: self.next_id - 1,
            history_len: self.history.len(),
            recovered: self.recovered,
            timed_out: self.timed_out,
            last_measurement: self.last_measurement,
        }
    }
}

fn recovery_procedure(kind: DisturbanceType) -> &'static str {
    match kind {
        DisturbanceType::FrequencyDrop | DisturbanceType::FrequencyRise => {
            "restore active power setpoint"
        }
        DisturbanceType::VoltageDrop | DisturbanceType::VoltageRise => {
            "restore reactive power setpoint"
        }
        DisturbanceType::FrequencyOscillation | DisturbanceType::VoltageOscillation => {
            "release damping control"
        }
        DisturbanceType::PowerQuality => "return harmonic filter to standby",
        DisturbanceType::GridFault => "verify grid before resynchronisation",
    }
}

fn load_shed_fraction(severity: DisturbanceSeverity) -> f64 {
    match severity {
        DisturbanceSeverity::Critical => 0.25,
        DisturbanceSeverity::Major => 0.10,
        DisturbanceSeverity::Minor | DisturbanceSeverity::Moderate => 0.0,
    }
}

fn damping_gain(swing: f64, table: &SeverityThresholds) -> f64 {
    (swing / table.critical).clamp(0.1, 1.0)
}

fn action_commands(action: &ResponseAction) -> CommandSet {
    let mut commands = CommandSet::default();
    match action {
        ResponseAction::IncreaseActivePower { percent } => {
            commands.electrical.power_adjustment_pct = Some(*percent);
        }
        ResponseAction::DecreaseActivePower { percent } => {
            commands.electrical.power_adjustment_pct = Some(-*percent);
        }
        ResponseAction::IncreaseReactivePower { percent } => {
            commands.electrical.reactive_power_adjustment_pct = Some(*percent);
        }
        ResponseAction::DecreaseReactivePower { percent } => {
            commands.electrical.reactive_power_adjustment_pct = Some(-*percent);
        }
        ResponseAction::DampingControl { gain } => {
            commands.control = ControlCommands {
                damping_control: Some(true),
                damping_gain: Some(*gain),
                ..ControlCommands::default()
            };
        }
        ResponseAction::HarmonicFiltering => {
            commands.electrical = ElectricalCommands {
                harmonic_filter_enabled: Some(true),
                power_factor_correction: Some(true),
                ..ElectricalCommands::default()
            };
        }
        ResponseAction::EmergencyDisconnect => {
            commands.electrical = ElectricalCommands {
                grid_connect: Some(false),
                synchronization_enable: Some(false),
                ..ElectricalCommands::default()
            };
            commands.control.islanded_mode = Some(true);
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> GridDisturbanceHandler {
        GridDisturbanceHandler::new(GridDisturbanceConfig::default())
    }

    #[test]
    fn classification_follows_tables() {
        let table = SeverityThresholds::new(5.0, 10.0, 15.0, 20.0);
        assert_eq!(DisturbanceSeverity::classify(4.9, &table), None);
        assert_eq!(
            DisturbanceSeverity::classify(10.4, &table),
            Some(DisturbanceSeverity::Moderate)
        );
        assert_eq!(
            DisturbanceSeverity::classify(20.0, &table),
            Some(DisturbanceSeverity::Critical)
        );
    }

    #[test]
    fn severity_only_escalates_while_active() {
        let mut handler = handler();
        handler.monitor(&GridMeasurement::nominal(59.0, 480.0), 0.0);
        let event = handler.active_event(DisturbanceType::FrequencyDrop).unwrap();
        assert_eq!(event.severity, DisturbanceSeverity::Major);

        handler.monitor(&GridMeasurement::nominal(59.8, 480.0), 1.0);
        let event = handler.active_event(DisturbanceType::FrequencyDrop).unwrap();
        assert_eq!(event.severity, DisturbanceSeverity::Major);
        assert!(event.magnitude < event.peak_magnitude);
    }

    #[test]
    fn recovers_when_magnitude_falls_below_minor() {
        let mut handler = handler();
        assert!(handler.monitor(&GridMeasurement::nominal(60.0, 440.0), 0.0));
        assert!(!handler.monitor(&GridMeasurement::nominal(60.0, 478.0), 2.0));
        let record = handler.history().latest().unwrap();
        assert_eq!(record.kind, DisturbanceType::VoltageDrop);
        assert_eq!(record.outcome, Some(ResolutionOutcome::Recovered));
        assert_eq!(record.duration, Some(2.0));
    }

    #[test]
    fn persistent_disturbance_times_out() {
        let mut handler = handler();
        for step in 0..=31 {
            handler.monitor(&GridMeasurement::nominal(60.0, 440.0), f64::from(step));
        }
        let record = handler.history().latest().unwrap();
        assert_eq!(record.outcome, Some(ResolutionOutcome::TimedOut));
        assert_eq!(handler.status().timed_out, 1);
    }

    #[test]
    fn outage_is_a_critical_fault_requiring_disconnect() {
        let mut handler = handler();
        let mut measurement = GridMeasurement::nominal(60.0, 0.0);
        measurement.connected = false;
        handler.monitor(&measurement, 0.0);
        let response = handler.execute_response(0.0);
        assert_eq!(response.response_mode, ResponseMode::Disconnect);
        assert!(response.disconnect_required);
        assert!(response.disconnect_event.is_some());
        assert_eq!(response.commands.electrical.grid_connect, Some(false));
        assert_eq!(handler.active().count(), 1);
    }

    #[test]
    fn frequency_support_outranks_voltage_support() {
        let mut handler = handler();
        handler.monitor(&GridMeasurement::nominal(59.7, 440.0), 0.0);
        let response = handler.execute_response(0.0);
        assert_eq!(response.response_mode, ResponseMode::FrequencySupport);
        let power = response.commands.electrical.power_adjustment_pct.unwrap();
        assert!((power - 10.0).abs() < 1e-6);
        assert!(response.commands.electrical.reactive_power_adjustment_pct.unwrap() > 0.0);
    }

    #[test]
    fn oscillation_needs_mean_crossings() {
        let mut handler = handler();
        for step in 0..20 {
            let frequency = if step % 2 == 0 { 60.2 } else { 59.8 };
            handler.monitor(&GridMeasurement::nominal(frequency, 480.0), f64::from(step) * 0.1);
        }
        let event = handler
            .active_event(DisturbanceType::FrequencyOscillation)
            .unwrap();
        assert_eq!(event.severity, DisturbanceSeverity::Moderate);
        let response = handler.execute_response(2.0);
        assert_eq!(response.commands.control.damping_control, Some(true));
    }

    #[test]
    fn sag_stays_active_through_a_grid_fault() {
        let mut handler = handler();
        handler.monitor(&GridMeasurement::nominal(60.0, 430.0), 0.0);
        let sag_id = handler.active_event(DisturbanceType::VoltageDrop).unwrap().id;

        assert!(handler.monitor(&GridMeasurement::nominal(60.0, 320.0), 1.0));
        assert!(handler.active_event(DisturbanceType::GridFault).is_some());
        let sag = handler.active_event(DisturbanceType::VoltageDrop).unwrap();
        assert_eq!(sag.id, sag_id);
        assert_eq!(sag.severity, DisturbanceSeverity::Critical);
        assert!(sag.peak_magnitude > 30.0);

        let mut outage = GridMeasurement::nominal(60.0, 0.0);
        outage.connected = false;
        handler.monitor(&outage, 2.0);
        assert!(handler.active_event(DisturbanceType::VoltageDrop).is_some());
        assert!(handler.history().is_empty());
        assert_eq!(handler.status().recovered, 0);
    }

    #[test]
    fn fault_recovery_leaves_sag_until_voltage_returns() {
        let mut handler = handler();
        handler.monitor(&GridMeasurement::nominal(60.0, 430.0), 0.0);
        handler.monitor(&GridMeasurement::nominal(60.0, 320.0), 1.0);
        handler.monitor(&GridMeasurement::nominal(60.0, 430.0), 2.0);
        assert!(handler.active_event(DisturbanceType::GridFault).is_none());
        assert!(handler.active_event(DisturbanceType::VoltageDrop).is_some());
        let record = handler.history().latest().unwrap();
        assert_eq!(record.kind, DisturbanceType::GridFault);

        assert!(!handler.monitor(&GridMeasurement::nominal(60.0, 479.0), 3.0));
        let record = handler.history().latest().unwrap();
        assert_eq!(record.kind, DisturbanceType::VoltageDrop);
        assert_eq!(record.outcome, Some(ResolutionOutcome::Recovered));
    }

    #[test]
    fn alternating_frequency_keeps_one_directional_event() {
        let mut handler = handler();
        handler.monitor(&GridMeasurement::nominal(60.2, 480.0), 0.0);
        let first_id = handler.active_event(DisturbanceType::FrequencyRise).unwrap().id;
        for step in 1..40 {
            let frequency = if step % 2 == 0 { 60.2 } else { 59.8 };
            handler.monitor(&GridMeasurement::nominal(frequency, 480.0), f64::from(step) * 0.1);
            let directional: Vec<_> = handler
                .active()
                .filter(|event| {
                    matches!(
                        event.kind,
                        DisturbanceType::FrequencyDrop | DisturbanceType::FrequencyRise
                    )
                })
                .collect();
            assert_eq!(directional.len(), 1);
            assert_eq!(directional[0].id, first_id);
        }
        assert!(handler.history().is_empty());
        assert!(handler
            .active_event(DisturbanceType::FrequencyOscillation)
            .is_some());

        let response = handler.execute_response(4.0);
        assert_eq!(response.active_count, 2);
        assert_eq!(response.responses.len(), 1);
        assert_eq!(response.commands.control.damping_control, Some(true));
    }
}
