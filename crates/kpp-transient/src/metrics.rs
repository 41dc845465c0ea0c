//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use kpp_metrics::SharedRegistry;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

/// Metrics published by the transient coordination layer.
#[derive(Clone)]
pub struct TransientMetrics {
    registry: SharedRegistry,
    emergencies_total: IntCounterVec,
    emergency_response_seconds: HistogramVec,
    interlock_trips_total: IntCounterVec,
    shutdowns_total: IntCounterVec,
    disturbances_total: IntCounterVec,
    disturbance_resolutions_total: IntCounterVec,
    startup_outcomes_total: IntCounterVec,
    state_transitions_total: IntCounterVec,
    system_state: IntGaugeVec,
}

impl TransientMetrics {
    /// Register the metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let emergencies_total = IntCounterVec::new(
            Opts::new(
                "kpp_transient_emergencies_total",
                "Emergencies raised, by type and severity",
            ),
            &["type", "severity"],
        )?;
        registry.register(Box::new(emergencies_total.clone()))?;

        let emergency_response_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kpp_transient_emergency_response_seconds",
                "Simulation time between an emergency being raised and resolved",
            )
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 14)?),
            &["type"],
        )?;
        registry.register(Box::new(emergency_response_seconds.clone()))?;

        let interlock_trips_total = IntCounterVec::new(
            Opts::new(
                "kpp_transient_interlock_trips_total",
                "Safety interlock trips, by interlock",
            ),
            &["interlock"],
        )?;
        registry.register(Box::new(interlock_trips_total.clone()))?;

        let shutdowns_total = IntCounterVec::new(
            Opts::new(
                "kpp_transient_shutdowns_total",
                "Shutdown procedures started, by procedure",
            ),
            &["procedure"],
        )?;
        registry.register(Box::new(shutdowns_total.clone()))?;

        let disturbances_total = IntCounterVec::new(
            Opts::new(
                "kpp_transient_disturbances_total",
                "Grid disturbances detected, by type and initial severity",
            ),
            &["type", "severity"],
        )?;
        registry.register(Box::new(disturbances_total.clone()))?;

        let disturbance_resolutions_total = IntCounterVec::new(
            Opts::new(
                "kpp_transient_disturbance_resolutions_total",
                "Grid disturbance resolutions, by type and outcome",
            ),
            &["type", "outcome"],
        )?;
        registry.register(Box::new(disturbance_resolutions_total.clone()))?;

        let startup_outcomes_total = IntCounterVec::new(
            Opts::new(
                "kpp_transient_startup_outcomes_total",
                "Finished startup sequences, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(startup_outcomes_total.clone()))?;

        let state_transitions_total = IntCounterVec::new(
            Opts::new(
                "kpp_transient_state_transitions_total",
                "System state transitions, by source and target state",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(state_transitions_total.clone()))?;

        let system_state = IntGaugeVec::new(
            Opts::new(
                "kpp_transient_system_state",
                "Indicator (0/1) of the current plant system state",
            ),
            &["state"],
        )?;
        registry.register(Box::new(system_state.clone()))?;

        Ok(Self {
            registry,
            emergencies_total,
            emergency_response_seconds,
            interlock_trips_total,
            shutdowns_total,
            disturbances_total,
            disturbance_resolutions_total,
            startup_outcomes_total,
            state_transitions_total,
            system_state,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_emergency(&self, kind: &str, severity: &str) {
        self.emergencies_total
            .with_label_values(&[kind, severity])
            .inc();
    }

    pub fn observe_emergency_response(&self, kind: &str, response: Duration) {
        self.emergency_response_seconds
            .with_label_values(&[kind])
            .observe(response.as_secs_f64());
    }

    pub fn record_interlock_trip(&self, interlock: &str) {
        self.interlock_trips_total
            .with_label_values(&[interlock])
            .inc();
    }

    pub fn record_shutdown(&self, procedure: &str) {
        self.shutdowns_total.with_label_values(&[procedure]).inc();
    }

    pub fn record_disturbance(&self, kind: &str, severity: &str) {
        self.disturbances_total
            .with_label_values(&[kind, severity])
            .inc();
    }

    pub fn record_disturbance_resolution(&self, kind: &str, outcome: &str) {
        self.disturbance_resolutions_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn record_startup_outcome(&self, outcome: &str) {
        self.startup_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Count a transition and flip the state indicator gauges.
    pub fn record_transition(&self, from: &str, to: &str) {
        self.state_transitions_total
            .with_label_values(&[from, to])
            .inc();
        self.system_state.with_label_values(&[from]).set(0);
        self.system_state.with_label_values(&[to]).set(1);
    }
}

impl std::fmt::Debug for TransientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientMetrics").finish_non_exhaustive()
    }
}
