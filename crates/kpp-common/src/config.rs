//! ---
//! kpp_section: "01-core-functionality"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Shared primitives and utilities for the core runtime."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_simulation_seed() -> u64 {
    0xB0_0E7
}

fn default_true() -> bool {
    true
}

/// Primary configuration object for the KPP runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub transient: TransientConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "KPP_CONFIG";

    /// Load configuration from disk, respecting the `KPP_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Unlike a deployment manifest the transient layer is fully usable with
    /// built-in defaults, so an empty candidate list falls back to
    /// [`AppConfig::default`] instead of failing.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    /// Read and validate a single TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.transient.apply_plant_nominal();
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()?;
        self.transient.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let mut config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.transient.apply_plant_nominal();
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Settings for the plant model that feeds snapshots into the controller.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_tick_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
    #[serde(default)]
    pub sensor_noise: bool,
    #[serde(default)]
    pub scenario_file: Option<PathBuf>,
    #[serde(default = "default_floater_count")]
    pub floater_count: usize,
}

fn default_floater_count() -> usize {
    8
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            random_seed: default_simulation_seed(),
            sensor_noise: false,
            scenario_file: None,
            floater_count: default_floater_count(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(anyhow!("simulation.tick_interval must be positive"));
        }
        Ok(())
    }

    /// Tick interval expressed as simulation seconds.
    pub fn tick_seconds(&self) -> f64 {
        self.tick_interval.as_secs_f64()
    }
}

/// Aggregate configuration for the transient-event coordination layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransientConfig {
    /// Grid nominals shared by every leaf. The only place they are set.
    #[serde(default)]
    pub plant: GridNominal,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub grid: GridDisturbanceConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

impl TransientConfig {
    /// Copy the `[transient.plant]` nominals into every leaf section.
    pub fn apply_plant_nominal(&mut self) {
        self.startup.nominal = self.plant;
        self.emergency.interlocks.nominal = self.plant;
        self.grid.nominal = self.plant;
    }

    /// Builder form of [`TransientConfig::apply_plant_nominal`] with new nominals.
    pub fn with_plant_nominal(mut self, plant: GridNominal) -> Self {
        self.plant = plant;
        self.apply_plant_nominal();
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.plant.validate().context("invalid [transient.plant] section")?;
        for (section, nominal) in [
            ("startup", self.startup.nominal),
            ("emergency.interlocks", self.emergency.interlocks.nominal),
            ("grid", self.grid.nominal),
        ] {
            if nominal != self.plant {
                return Err(anyhow!(
                    "[transient.{}] nominal {:?} disagrees with [transient.plant] {:?}",
                    section,
                    nominal,
                    self.plant
                ));
            }
        }
        self.startup
            .validate()
            .context("invalid [transient.startup] section")?;
        self.emergency
            .validate()
            .context("invalid [transient.emergency] section")?;
        self.grid.validate().context("invalid [transient.grid] section")?;
        self.controller
            .validate()
            .context("invalid [transient.controller] section")?;
        Ok(())
    }
}

/// Nominal grid frequency and voltage of the plant's connection point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridNominal {
    pub nominal_frequency_hz: f64,
    pub nominal_voltage_v: f64,
}

impl Default for GridNominal {
    fn default() -> Self {
        Self {
            nominal_frequency_hz: 60.0,
            nominal_voltage_v: 480.0,
        }
    }
}

impl GridNominal {
    pub const fn new(nominal_frequency_hz: f64, nominal_voltage_v: f64) -> Self {
        Self {
            nominal_frequency_hz,
            nominal_voltage_v,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.nominal_frequency_hz != 50.0 && self.nominal_frequency_hz != 60.0 {
            return Err(anyhow!(
                "nominal_frequency_hz must be 50 or 60 (got {})",
                self.nominal_frequency_hz
            ));
        }
        if !self.nominal_voltage_v.is_finite() || self.nominal_voltage_v <= 0.0 {
            return Err(anyhow!("nominal_voltage_v must be positive"));
        }
        Ok(())
    }
}

/// Per-phase startup timeouts.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PhaseTimeouts {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub initialization: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub system_checks: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub pressure_build: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub first_injection: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub acceleration: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub synchronization: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            initialization: Duration::from_secs(10),
            system_checks: Duration::from_secs(15),
            pressure_build: Duration::from_secs(30),
            first_injection: Duration::from_secs(20),
            acceleration: Duration::from_secs(60),
            synchronization: Duration::from_secs(30),
        }
    }
}

impl PhaseTimeouts {
    fn all(&self) -> [(&'static str, Duration); 6] {
        [
            ("initialization", self.initialization),
            ("system_checks", self.system_checks),
            ("pressure_build", self.pressure_build),
            ("first_injection", self.first_injection),
            ("acceleration", self.acceleration),
            ("synchronization", self.synchronization),
        ]
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub phase_timeouts: PhaseTimeouts,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub initialization_dwell: Duration,
    pub min_check_pressure_bar: f64,
    pub max_component_temperature_c: f64,
    pub min_floater_count: usize,
    pub target_pressure_bar: f64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub pressure_ramp: Duration,
    pub first_injection_frequency_hz: f64,
    pub max_injection_frequency_hz: f64,
    pub first_motion_speed_rpm: f64,
    pub target_speed_rpm: f64,
    pub speed_tolerance: f64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub acceleration_ramp: Duration,
    pub synchronous_speed_rpm: f64,
    /// Filled from `[transient.plant]`.
    #[serde(skip)]
    pub nominal: GridNominal,
    pub sync_frequency_tolerance_hz: f64,
    pub sync_voltage_tolerance: f64,
    pub sync_retry_limit: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub sync_retry_interval: Duration,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            phase_timeouts: PhaseTimeouts::default(),
            initialization_dwell: Duration::from_secs(2),
            min_check_pressure_bar: 1.0,
            max_component_temperature_c: 80.0,
            min_floater_count: 4,
            target_pressure_bar: 5.0,
            pressure_ramp: Duration::from_secs(20),
            first_injection_frequency_hz: 0.2,
            max_injection_frequency_hz: 1.0,
            first_motion_speed_rpm: 5.0,
            target_speed_rpm: 375.0,
            speed_tolerance: 0.05,
            acceleration_ramp: Duration::from_secs(45),
            synchronous_speed_rpm: 375.0,
            nominal: GridNominal::default(),
            sync_frequency_tolerance_hz: 0.2,
            sync_voltage_tolerance: 0.10,
            sync_retry_limit: 3,
            sync_retry_interval: Duration::from_secs(5),
        }
    }
}

impl StartupConfig {
    pub fn validate(&self) -> Result<()> {
        for (phase, timeout) in self.phase_timeouts.all() {
            if timeout.is_zero() {
                return Err(anyhow!("phase timeout for {} must be positive", phase));
            }
        }
        if self.sync_retry_limit == 0 {
            return Err(anyhow!("sync_retry_limit must be at least 1"));
        }
        if self.target_speed_rpm <= 0.0 || self.synchronous_speed_rpm <= 0.0 {
            return Err(anyhow!("speed targets must be positive"));
        }
        if self.target_pressure_bar < self.min_check_pressure_bar {
            return Err(anyhow!(
                "target_pressure_bar ({}) must not be below min_check_pressure_bar ({})",
                self.target_pressure_bar,
                self.min_check_pressure_bar
            ));
        }
        if !(0.0..1.0).contains(&self.speed_tolerance) {
            return Err(anyhow!("speed_tolerance must be within [0, 1)"));
        }
        if self.max_injection_frequency_hz < self.first_injection_frequency_hz {
            return Err(anyhow!(
                "max_injection_frequency_hz must not be below first_injection_frequency_hz"
            ));
        }
        Ok(())
    }
}

/// Interlock trip thresholds, expressed against rated plant values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterlockThresholds {
    pub rated_current_a: f64,
    pub overload_factor: f64,
    pub rated_torque_nm: f64,
    pub mechanical_failure_factor: f64,
    pub max_component_temperature_c: f64,
    pub max_tank_pressure_bar: f64,
    pub rated_speed_rpm: f64,
    pub overspeed_factor: f64,
    pub overvoltage_factor: f64,
    pub max_frequency_deviation_hz: f64,
    /// Filled from `[transient.plant]`.
    #[serde(skip)]
    pub nominal: GridNominal,
}

impl Default for InterlockThresholds {
    fn default() -> Self {
        Self {
            rated_current_a: 100.0,
            overload_factor: 1.2,
            rated_torque_nm: 2_000.0,
            mechanical_failure_factor: 1.5,
            max_component_temperature_c: 95.0,
            max_tank_pressure_bar: 10.0,
            rated_speed_rpm: 450.0,
            overspeed_factor: 1.1,
            overvoltage_factor: 1.1,
            max_frequency_deviation_hz: 3.0,
            nominal: GridNominal::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    pub auto_shutdown: bool,
    pub interlocks: InterlockThresholds,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub controlled_ramp: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub gradual_ramp: Duration,
    pub history_capacity: usize,
    pub alarm_capacity: usize,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            auto_shutdown: true,
            interlocks: InterlockThresholds::default(),
            controlled_ramp: Duration::from_secs(10),
            gradual_ramp: Duration::from_secs(30),
            history_capacity: 1_000,
            alarm_capacity: 100,
        }
    }
}

impl EmergencyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 || self.alarm_capacity == 0 {
            return Err(anyhow!("history and alarm capacities must be positive"));
        }
        if self.controlled_ramp.is_zero() || self.gradual_ramp.is_zero() {
            return Err(anyhow!("shutdown ramps must be positive"));
        }
        let limits = &self.interlocks;
        for (name, factor) in [
            ("overload_factor", limits.overload_factor),
            ("mechanical_failure_factor", limits.mechanical_failure_factor),
            ("overspeed_factor", limits.overspeed_factor),
            ("overvoltage_factor", limits.overvoltage_factor),
        ] {
            if factor <= 1.0 {
                return Err(anyhow!("interlock {} must exceed 1.0 (got {})", name, factor));
            }
        }
        if limits.max_frequency_deviation_hz <= 0.0 {
            return Err(anyhow!("max_frequency_deviation_hz must be positive"));
        }
        Ok(())
    }
}

/// Four-tier severity table. Values are percent of nominal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeverityThresholds {
    pub minor: f64,
    pub moderate: f64,
    pub major: f64,
    pub critical: f64,
}

impl SeverityThresholds {
    pub const fn new(minor: f64, moderate: f64, major: f64, critical: f64) -> Self {
        Self {
            minor,
            moderate,
            major,
            critical,
        }
    }

    pub fn validate(&self, table: &str) -> Result<()> {
        let ascending = self.minor > 0.0
            && self.minor < self.moderate
            && self.moderate < self.major
            && self.major < self.critical;
        if !ascending {
            return Err(anyhow!(
                "severity table '{}' must be positive and strictly ascending: {:?}",
                table,
                self
            ));
        }
        Ok(())
    }
}

/// Disturbance magnitude tables, one per measurement family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisturbanceTables {
    pub frequency: SeverityThresholds,
    pub voltage: SeverityThresholds,
    pub harmonic_distortion: SeverityThresholds,
    pub power_factor_deficit: SeverityThresholds,
    pub frequency_oscillation: SeverityThresholds,
    pub voltage_oscillation: SeverityThresholds,
}

impl Default for DisturbanceTables {
    fn default() -> Self {
        Self {
            frequency: SeverityThresholds::new(0.2, 0.5, 1.0, 2.0),
            voltage: SeverityThresholds::new(5.0, 10.0, 15.0, 20.0),
            harmonic_distortion: SeverityThresholds::new(5.0, 8.0, 12.0, 20.0),
            power_factor_deficit: SeverityThresholds::new(5.0, 10.0, 15.0, 20.0),
            frequency_oscillation: SeverityThresholds::new(0.2, 0.5, 1.0, 2.0),
            voltage_oscillation: SeverityThresholds::new(2.0, 5.0, 8.0, 12.0),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridDisturbanceConfig {
    /// Filled from `[transient.plant]`.
    #[serde(skip)]
    pub nominal: GridNominal,
    pub tables: DisturbanceTables,
    pub fault_voltage_deviation_pct: f64,
    pub fault_frequency_deviation_pct: f64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub response_timeout: Duration,
    pub oscillation_window: usize,
    pub oscillation_min_crossings: usize,
    pub frequency_droop_gain: f64,
    pub max_power_adjustment_pct: f64,
    pub reactive_gain: f64,
    pub max_reactive_adjustment_pct: f64,
    pub history_capacity: usize,
}

impl Default for GridDisturbanceConfig {
    fn default() -> Self {
        Self {
            nominal: GridNominal::default(),
            tables: DisturbanceTables::default(),
            fault_voltage_deviation_pct: 30.0,
            fault_frequency_deviation_pct: 5.0,
            response_timeout: Duration::from_secs(30),
            oscillation_window: 20,
            oscillation_min_crossings: 4,
            frequency_droop_gain: 20.0,
            max_power_adjustment_pct: 30.0,
            reactive_gain: 2.0,
            max_reactive_adjustment_pct: 40.0,
            history_capacity: 500,
        }
    }
}

impl GridDisturbanceConfig {
    pub fn validate(&self) -> Result<()> {
        let tables = &self.tables;
        tables.frequency.validate("frequency")?;
        tables.voltage.validate("voltage")?;
        tables.harmonic_distortion.validate("harmonic_distortion")?;
        tables.power_factor_deficit.validate("power_factor_deficit")?;
        tables.frequency_oscillation.validate("frequency_oscillation")?;
        tables.voltage_oscillation.validate("voltage_oscillation")?;
        if self.fault_voltage_deviation_pct <= tables.voltage.critical {
            return Err(anyhow!(
                "fault_voltage_deviation_pct must exceed the critical voltage threshold"
            ));
        }
        if self.fault_frequency_deviation_pct <= tables.frequency.critical {
            return Err(anyhow!(
                "fault_frequency_deviation_pct must exceed the critical frequency threshold"
            ));
        }
        if self.response_timeout.is_zero() {
            return Err(anyhow!("response_timeout must be positive"));
        }
        if self.oscillation_window < 4 {
            return Err(anyhow!("oscillation_window must hold at least 4 samples"));
        }
        if self.history_capacity == 0 {
            return Err(anyhow!("history_capacity must be positive"));
        }
        Ok(())
    }
}

/// Settings owned by the root coordinator.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub recovery_dwell: Duration,
    pub transition_history_capacity: usize,
    pub operational_pressure_bar: f64,
    pub operational_injection_frequency_hz: f64,
    pub operational_speed_rpm: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            recovery_dwell: Duration::from_secs(5),
            transition_history_capacity: 200,
            operational_pressure_bar: 5.0,
            operational_injection_frequency_hz: 1.0,
            operational_speed_rpm: 375.0,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transition_history_capacity == 0 {
            return Err(anyhow!("transition_history_capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_fractional_durations_and_partial_sections() {
        let config: AppConfig = r#"
            [transient.startup]
            sync_retry_limit = 5

            [transient.startup.phase_timeouts]
            initialization = 2.5
            system_checks = 15
            pressure_build = 30
            first_injection = 20
            acceleration = 60
            synchronization = 30

            [transient.plant]
            nominal_frequency_hz = 50.0
        "#
        .parse()
        .unwrap();
        assert_eq!(config.transient.startup.sync_retry_limit, 5);
        assert_eq!(
            config.transient.startup.phase_timeouts.initialization,
            Duration::from_millis(2_500)
        );
        let plant = GridNominal::new(50.0, 480.0);
        assert_eq!(config.transient.plant, plant);
        assert_eq!(config.transient.grid.nominal, plant);
        assert_eq!(config.transient.startup.nominal, plant);
        assert_eq!(config.transient.emergency.interlocks.nominal, plant);
        assert!(config.transient.emergency.auto_shutdown);
    }

    #[test]
    fn rejects_non_ascending_tables() {
        let err = r#"
            [transient.grid.tables]
            voltage = { minor = 10.0, moderate = 5.0, major = 15.0, critical = 20.0 }
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(format!("{:#}", err).contains("voltage"));
    }

    #[test]
    fn leaf_sections_cannot_override_plant_nominal() {
        let config: AppConfig = "[transient.grid]\nnominal_frequency_hz = 50.0\n"
            .parse()
            .unwrap();
        assert_eq!(config.transient.grid.nominal, GridNominal::default());
    }

    #[test]
    fn rejects_mismatched_leaf_nominal() {
        let mut transient = TransientConfig::default();
        transient.grid.nominal = GridNominal::new(50.0, 480.0);
        let err = transient.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("[transient.grid]"));
        transient.apply_plant_nominal();
        assert!(transient.validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_nominal_frequency() {
        let err = "[transient.plant]\nnominal_frequency_hz = 55.0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{:#}", err).contains("50 or 60"));
    }

    #[test]
    fn rejects_zero_retry_limit() {
        let err = "[transient.startup]\nsync_retry_limit = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{:#}", err).contains("sync_retry_limit"));
    }
}
