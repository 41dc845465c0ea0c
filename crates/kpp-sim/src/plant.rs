//! ---
//! kpp_section: "06-simulation"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Plant model and scenario scripts driving the transient controller."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Lumped first-order model of the buoyancy plant. It is deliberately coarse:
//! just enough dynamics for the startup predicates, interlocks and grid
//! classifier to see plausible readings in response to the controller's
//! commands.

use std::f64::consts::TAU;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use kpp_common::config::SimulationConfig;
use kpp_transient::commands::CommandSet;
use kpp_transient::snapshot::{FloaterReading, PneumaticReadings, SystemSnapshot};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Physical constants of the lumped model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlantParameters {
    pub ambient_temperature_c: f64,
    /// Tank pressure reported before the compressor first runs.
    pub initial_tank_pressure_bar: f64,
    pub compressor_rate_bar_per_s: f64,
    pub vent_rate_bar_per_s: f64,
    pub leak_rate_bar_per_s: f64,
    /// Air consumed per Hz of injection, in bar per second.
    pub injection_consumption_bar_per_hz_s: f64,
    /// Free-running flywheel speed produced by 1 Hz of injection.
    pub rpm_per_injection_hz: f64,
    pub speed_time_constant_s: f64,
    pub coast_time_constant_s: f64,
    pub brake_deceleration_rpm_per_s: f64,
    pub chain_ratio: f64,
    pub rated_speed_rpm: f64,
    pub rated_torque_nm: f64,
    pub rated_current_a: f64,
    pub thermal_time_constant_s: f64,
    /// Voltage lift at the coupling point per percent of reactive support.
    pub reactive_voltage_gain: f64,
    pub pressure_noise_bar: f64,
    pub speed_noise_rpm: f64,
    pub voltage_noise_v: f64,
    pub frequency_noise_hz: f64,
}

impl Default for PlantParameters {
    fn default() -> Self {
        Self {
            ambient_temperature_c: 25.0,
            initial_tank_pressure_bar: 1.5,
            compressor_rate_bar_per_s: 0.5,
            vent_rate_bar_per_s: 1.0,
            leak_rate_bar_per_s: 0.001,
            injection_consumption_bar_per_hz_s: 0.05,
            rpm_per_injection_hz: 375.0,
            speed_time_constant_s: 2.5,
            coast_time_constant_s: 20.0,
            brake_deceleration_rpm_per_s: 60.0,
            chain_ratio: 0.1,
            rated_speed_rpm: 375.0,
            rated_torque_nm: 2_000.0,
            rated_current_a: 100.0,
            thermal_time_constant_s: 60.0,
            reactive_voltage_gain: 0.0005,
            pressure_noise_bar: 0.005,
            speed_noise_rpm: 0.05,
            voltage_noise_v: 0.2,
            frequency_noise_hz: 0.002,
        }
    }
}

/// Conditions imposed on the plant from outside: the grid it couples to and
/// any injected component faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCondition {
    pub nominal_voltage_v: f64,
    pub nominal_frequency_hz: f64,
    pub voltage_v: f64,
    pub frequency_hz: f64,
    pub available: bool,
    pub power_factor: f64,
    pub thd_percent: f64,
    pub oscillation_amplitude_hz: f64,
    pub oscillation_period_s: f64,
}

impl GridCondition {
    pub fn nominal(voltage_v: f64, frequency_hz: f64) -> Self {
        Self {
            nominal_voltage_v: voltage_v,
            nominal_frequency_hz: frequency_hz,
            voltage_v,
            frequency_hz,
            available: true,
            power_factor: 1.0,
            thd_percent: 0.0,
            oscillation_amplitude_hz: 0.0,
            oscillation_period_s: 1.0,
        }
    }

    fn restore(&mut self) {
        *self = Self::nominal(self.nominal_voltage_v, self.nominal_frequency_hz);
    }
}

/// Disturbances a scenario can impose on the plant or its grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "inject", rename_all = "snake_case")]
pub enum PlantInjection {
    GridVoltage { voltage_v: f64 },
    GridFrequency { frequency_hz: f64 },
    GridOutage,
    GridRestore,
    FrequencyOscillation { amplitude_hz: f64, period_s: f64 },
    PowerQuality { thd_percent: f64, power_factor: f64 },
    /// Kick the flywheel to `rpm`; the speed loop pulls it back afterwards.
    Overspeed { rpm: f64 },
    /// Pin a component temperature until faults are cleared.
    ComponentOverheat { component: String, celsius: f64 },
    TankPressure { bar: f64 },
    ClearFaults,
}

/// Internal plant state, in engineering units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlantState {
    pub time: f64,
    pub tank_pressure_bar: f64,
    pub flywheel_speed_rpm: f64,
    pub temperatures: IndexMap<String, f64>,
    pub torque_nm: f64,
    pub generator_current_a: f64,
    pub injection_phase: f64,
    /// Switch positions latched from the most recent command naming them.
    pub actuators: CommandSet,
}

/// Plant model stepped once per controller tick.
#[derive(Debug)]
pub struct PlantModel {
    params: PlantParameters,
    grid: GridCondition,
    state: PlantState,
    floater_count: usize,
    overrides: IndexMap<String, f64>,
    rng: StdRng,
    noise: Option<Normal<f64>>,
}

impl PlantModel {
    pub fn new(config: &SimulationConfig, grid: GridCondition) -> Result<Self> {
        Self::with_parameters(config, grid, PlantParameters::default())
    }

    pub fn with_parameters(
        config: &SimulationConfig,
        grid: GridCondition,
        params: PlantParameters,
    ) -> Result<Self> {
        let noise = if config.sensor_noise {
            Some(Normal::new(0.0, 1.0).context("failed to build unit normal for sensor noise")?)
        } else {
            None
        };
        let mut temperatures = IndexMap::new();
        temperatures.insert("generator".to_owned(), params.ambient_temperature_c);
        temperatures.insert("compressor".to_owned(), params.ambient_temperature_c);
        let state = PlantState {
            time: 0.0,
            tank_pressure_bar: params.initial_tank_pressure_bar,
            flywheel_speed_rpm: 0.0,
            temperatures,
            torque_nm: 0.0,
            generator_current_a: 0.0,
            injection_phase: 0.0,
            actuators: CommandSet::idle_hold(),
        };
        Ok(Self {
            params,
            grid,
            state,
            floater_count: config.floater_count,
            overrides: IndexMap::new(),
            rng: StdRng::seed_from_u64(config.random_seed),
            noise,
        })
    }

    pub fn state(&self) -> &PlantState {
        &self.state
    }

    pub fn grid(&self) -> &GridCondition {
        &self.grid
    }

    pub fn time(&self) -> f64 {
        self.state.time
    }

    pub fn apply(&mut self, injection: &PlantInjection) {
        info!(target: "kpp::sim::plant", time = self.state.time, ?injection, "injecting disturbance");
        match injection {
            PlantInjection::GridVoltage { voltage_v } => self.grid.voltage_v = *voltage_v,
            PlantInjection::GridFrequency { frequency_hz } => self.grid.frequency_hz = *frequency_hz,
            PlantInjection::GridOutage => {
                self.grid.available = false;
                self.grid.voltage_v = 0.0;
            }
            PlantInjection::GridRestore => self.grid.restore(),
            PlantInjection::FrequencyOscillation {
                amplitude_hz,
                period_s,
            } => {
                self.grid.oscillation_amplitude_hz = amplitude_hz.abs();
                self.grid.oscillation_period_s = period_s.max(f64::EPSILON);
            }
            PlantInjection::PowerQuality {
                thd_percent,
                power_factor,
            } => {
                self.grid.thd_percent = *thd_percent;
                self.grid.power_factor = *power_factor;
            }
            PlantInjection::Overspeed { rpm } => self.state.flywheel_speed_rpm = *rpm,
            PlantInjection::ComponentOverheat { component, celsius } => {
                self.overrides.insert(component.clone(), *celsius);
            }
            PlantInjection::TankPressure { bar } => self.state.tank_pressure_bar = bar.max(0.0),
            PlantInjection::ClearFaults => {
                self.overrides.clear();
                self.grid.oscillation_amplitude_hz = 0.0;
                self.grid.thd_percent = 0.0;
                self.grid.power_factor = 1.0;
            }
        }
    }

    /// Advance the model by `dt` seconds under `commands` and report the new
    /// readings. Switches latch; setpoints apply only on ticks that name them.
    pub fn step(&mut self, commands: &CommandSet, dt: f64) -> SystemSnapshot {
        let dt = dt.max(0.0);
        self.state.actuators.overlay(commands);
        self.step_pneumatics(commands, dt);
        self.step_mechanics(commands, dt);
        self.step_electrical();
        self.step_thermal(dt);
        self.state.time += dt;
        debug!(
            target: "kpp::sim::plant",
            time = self.state.time,
            pressure = self.state.tank_pressure_bar,
            speed = self.state.flywheel_speed_rpm,
            "plant stepped"
        );
        self.snapshot()
    }

    /// Sensor view of the current state, noise applied when enabled.
    pub fn snapshot(&mut self) -> SystemSnapshot {
        let params = self.params.clone();
        let speed = (self.state.flywheel_speed_rpm + self.noise(params.speed_noise_rpm)).max(0.0);
        let pressure =
            (self.state.tank_pressure_bar + self.noise(params.pressure_noise_bar)).max(0.0);
        let (voltage, frequency) = self.coupling_point();
        let voltage = if self.grid.available {
            voltage + self.noise(params.voltage_noise_v)
        } else {
            voltage
        };
        let frequency = frequency + self.noise(params.frequency_noise_hz);

        let mut temperatures = self.state.temperatures.clone();
        for (component, celsius) in &self.overrides {
            temperatures.insert(component.clone(), *celsius);
        }
        let floaters = (0..self.floater_count)
            .map(|index| FloaterReading {
                id: index as u32 + 1,
                fill_progress: (self.state.injection_phase
                    + index as f64 / self.floater_count as f64)
                    .fract(),
            })
            .collect();

        SystemSnapshot {
            time: self.state.time,
            pneumatics: PneumaticReadings {
                tank_pressure: pressure,
            },
            component_temperatures: temperatures,
            floaters,
            flywheel_speed_rpm: speed,
            chain_speed_rpm: speed * params.chain_ratio,
            torque: self.state.torque_nm,
            generator_current: self.state.generator_current_a,
            grid_voltage: voltage,
            grid_frequency: frequency,
            grid_connected: self.grid.available,
            power_factor: self.grid.power_factor,
            thd_percent: self.grid.thd_percent,
        }
    }

    fn noise(&mut self, sigma: f64) -> f64 {
        match self.noise {
            Some(normal) => normal.sample(&mut self.rng) * sigma,
            None => 0.0,
        }
    }

    /// Voltage and frequency seen at the point of common coupling. An
    /// unavailable grid reads zero volts at nominal frequency.
    fn coupling_point(&self) -> (f64, f64) {
        if !self.grid.available {
            return (0.0, self.grid.nominal_frequency_hz);
        }
        let actuators = &self.state.actuators.electrical;
        let support = if actuators.grid_connect == Some(true) {
            actuators.reactive_power_adjustment_pct.unwrap_or(0.0)
        } else {
            0.0
        };
        let voltage = self.grid.voltage_v * (1.0 + support * self.params.reactive_voltage_gain);
        let oscillation = self.grid.oscillation_amplitude_hz
            * (TAU * self.state.time / self.grid.oscillation_period_s).sin();
        (voltage, self.grid.frequency_hz + oscillation)
    }

    fn step_pneumatics(&mut self, commands: &CommandSet, dt: f64) {
        let params = &self.params;
        let pneumatic = &self.state.actuators.pneumatic;
        let injection_hz = self.injection_hz();
        let mut pressure = self.state.tank_pressure_bar;

        pressure -= params.leak_rate_bar_per_s * dt;
        pressure -= injection_hz * params.injection_consumption_bar_per_hz_s * dt;
        if pneumatic.vent_valves_open == Some(true) {
            pressure -= params.vent_rate_bar_per_s * dt;
        }
        if pneumatic.compressor_enabled == Some(true) {
            if let Some(setpoint) = commands.pneumatic.pressure_setpoint {
                if pressure < setpoint {
                    pressure = (pressure + params.compressor_rate_bar_per_s * dt).min(setpoint);
                }
            }
        }
        self.state.tank_pressure_bar = pressure.max(0.0);
        if self.floater_count > 0 {
            self.state.injection_phase =
                (self.state.injection_phase + injection_hz * dt / self.floater_count as f64).fract();
        }
    }

    fn step_mechanics(&mut self, commands: &CommandSet, dt: f64) {
        let params = &self.params;
        let speed = self.state.flywheel_speed_rpm;
        if self.state.actuators.mechanical.mechanical_brake == Some(true) {
            self.state.flywheel_speed_rpm = (speed - params.brake_deceleration_rpm_per_s * dt).max(0.0);
            return;
        }
        let injection_hz = self.injection_hz();
        let (target, tau) = if injection_hz > 0.0 && self.state.tank_pressure_bar > 0.5 {
            let target = commands
                .control
                .speed_setpoint
                .unwrap_or(injection_hz * params.rpm_per_injection_hz);
            (target, params.speed_time_constant_s)
        } else {
            (0.0, params.coast_time_constant_s)
        };
        let alpha = (dt / tau).min(1.0);
        self.state.flywheel_speed_rpm = (speed + (target - speed) * alpha).max(0.0);
    }

    fn step_electrical(&mut self) {
        let params = &self.params;
        let electrical = &self.state.actuators.electrical;
        let online = electrical.generator_enable == Some(true)
            && electrical.grid_connect == Some(true)
            && self.grid.available;
        let load = if online {
            let shed = electrical.load_shed_fraction.unwrap_or(0.0).clamp(0.0, 1.0);
            let adjustment = 1.0 + electrical.power_adjustment_pct.unwrap_or(0.0) / 100.0;
            (electrical.load_factor.unwrap_or(0.0) * (1.0 - shed) * adjustment).clamp(0.0, 1.5)
        } else {
            0.0
        };
        let speed_fraction = (self.state.flywheel_speed_rpm / params.rated_speed_rpm).max(0.0);
        self.state.torque_nm = params.rated_torque_nm * 0.6 * load;
        self.state.generator_current_a = params.rated_current_a * 0.7 * load * speed_fraction;
    }

    fn step_thermal(&mut self, dt: f64) {
        let params = &self.params;
        let speed_fraction = (self.state.flywheel_speed_rpm / params.rated_speed_rpm).clamp(0.0, 1.5);
        let load = self.state.generator_current_a / params.rated_current_a;
        let compressor_on = self.state.actuators.pneumatic.compressor_enabled == Some(true);
        let targets = [
            (
                "generator",
                params.ambient_temperature_c + 10.0 * speed_fraction + 35.0 * load,
            ),
            (
                "compressor",
                params.ambient_temperature_c + if compressor_on { 27.0 } else { 0.0 },
            ),
        ];
        let alpha = (dt / params.thermal_time_constant_s).min(1.0);
        for (component, target) in targets {
            let current = self
                .state
                .temperatures
                .entry(component.to_owned())
                .or_insert(params.ambient_temperature_c);
            *current += (target - *current) * alpha;
        }
    }

    fn injection_hz(&self) -> f64 {
        let pneumatic = &self.state.actuators.pneumatic;
        if pneumatic.injection_enabled == Some(true) {
            pneumatic.injection_frequency.unwrap_or(0.0).max(0.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PlantModel {
        PlantModel::new(&SimulationConfig::default(), GridCondition::nominal(480.0, 60.0)).unwrap()
    }

    #[test]
    fn idle_plant_reports_ready_readings() {
        let mut plant = model();
        let snapshot = plant.step(&CommandSet::idle_hold(), 0.05);
        assert_eq!(snapshot.floaters.len(), 8);
        assert!(snapshot.pneumatics.tank_pressure > 1.0);
        assert_eq!(snapshot.flywheel_speed_rpm, 0.0);
        assert_eq!(snapshot.grid_voltage, 480.0);
        assert!(snapshot.grid_connected);
        snapshot.validate().unwrap();
    }

    #[test]
    fn compressor_tracks_rising_setpoint_without_overshoot() {
        let mut plant = model();
        let mut commands = CommandSet::idle_hold();
        commands.pneumatic.compressor_enabled = Some(true);
        commands.pneumatic.pressure_setpoint = Some(3.0);
        for _ in 0..200 {
            plant.step(&commands, 0.05);
        }
        let pressure = plant.state().tank_pressure_bar;
        assert!(pressure <= 3.0 && pressure > 2.9, "pressure {}", pressure);
    }

    #[test]
    fn brake_decelerates_flywheel_to_rest() {
        let mut plant = model();
        plant.apply(&PlantInjection::Overspeed { rpm: 120.0 });
        let snapshot = plant.step(&CommandSet::safe_stop(), 1.0);
        assert_eq!(snapshot.flywheel_speed_rpm, 60.0);
        let snapshot = plant.step(&CommandSet::safe_stop(), 2.0);
        assert_eq!(snapshot.flywheel_speed_rpm, 0.0);
    }

    #[test]
    fn outage_reads_zero_volts_at_nominal_frequency() {
        let mut plant = model();
        plant.apply(&PlantInjection::GridOutage);
        let snapshot = plant.step(&CommandSet::idle_hold(), 0.05);
        assert!(!snapshot.grid_connected);
        assert_eq!(snapshot.grid_voltage, 0.0);
        assert_eq!(snapshot.grid_frequency, 60.0);

        plant.apply(&PlantInjection::GridRestore);
        let snapshot = plant.step(&CommandSet::idle_hold(), 0.05);
        assert!(snapshot.grid_connected);
        assert_eq!(snapshot.grid_voltage, 480.0);
    }

    #[test]
    fn overheat_override_pins_reported_temperature() {
        let mut plant = model();
        plant.apply(&PlantInjection::ComponentOverheat {
            component: "generator".into(),
            celsius: 101.0,
        });
        let snapshot = plant.step(&CommandSet::idle_hold(), 0.05);
        assert_eq!(snapshot.max_temperature(), Some(("generator", 101.0)));
        plant.apply(&PlantInjection::ClearFaults);
        let snapshot = plant.step(&CommandSet::idle_hold(), 0.05);
        assert!(snapshot.component_temperatures["generator"] < 30.0);
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let config = SimulationConfig {
            sensor_noise: true,
            ..SimulationConfig::default()
        };
        let grid = GridCondition::nominal(480.0, 60.0);
        let mut a = PlantModel::new(&config, grid.clone()).unwrap();
        let mut b = PlantModel::new(&config, grid).unwrap();
        let first = a.step(&CommandSet::idle_hold(), 0.05);
        let second = b.step(&CommandSet::idle_hold(), 0.05);
        assert_eq!(first, second);
        assert_ne!(first.grid_voltage, 480.0);
    }
}
