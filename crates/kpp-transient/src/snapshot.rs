//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Sensor snapshot consumed once per tick, and the narrow per-leaf views
//! derived from it. Each leaf only sees the readings it acts on.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransientError};

fn default_power_factor() -> f64 {
    1.0
}

fn default_grid_connected() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PneumaticReadings {
    /// Storage tank pressure in bar.
    pub tank_pressure: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloaterReading {
    pub id: u32,
    /// Fraction of the floater volume filled with air, `0.0..=1.0`.
    pub fill_progress: f64,
}

/// Plant sensor view produced by the physics collaborators every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub time: f64,
    #[serde(default)]
    pub pneumatics: PneumaticReadings,
    #[serde(default)]
    pub component_temperatures: IndexMap<String, f64>,
    #[serde(default)]
    pub floaters: Vec<FloaterReading>,
    #[serde(default)]
    pub flywheel_speed_rpm: f64,
    #[serde(default)]
    pub chain_speed_rpm: f64,
    #[serde(default)]
    pub torque: f64,
    #[serde(default)]
    pub generator_current: f64,
    pub grid_voltage: f64,
    pub grid_frequency: f64,
    #[serde(default = "default_grid_connected")]
    pub grid_connected: bool,
    #[serde(default = "default_power_factor")]
    pub power_factor: f64,
    #[serde(default)]
    pub thd_percent: f64,
}

impl SystemSnapshot {
    /// A plant at rest, connected to a healthy grid.
    pub fn at_rest(time: f64, nominal_voltage: f64, nominal_frequency: f64) -> Self {
        Self {
            time,
            pneumatics: PneumaticReadings::default(),
            component_temperatures: IndexMap::new(),
            floaters: Vec::new(),
            flywheel_speed_rpm: 0.0,
            chain_speed_rpm: 0.0,
            torque: 0.0,
            generator_current: 0.0,
            grid_voltage: nominal_voltage,
            grid_frequency: nominal_frequency,
            grid_connected: true,
            power_factor: 1.0,
            thd_percent: 0.0,
        }
    }

    /// Hottest component, if any temperatures are reported.
    pub fn max_temperature(&self) -> Option<(&str, f64)> {
        self.component_temperatures
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .fold(None, |hottest, (name, value)| match hottest {
                Some((_, best)) if best >= value => hottest,
                _ => Some((name, value)),
            })
    }

    /// Reject readings that cannot be reasoned about. Any non-finite value is
    /// reported with the offending field name.
    pub fn validate(&self) -> Result<()> {
        let scalars = [
            ("time", self.time),
            ("pneumatics.tank_pressure", self.pneumatics.tank_pressure),
            ("flywheel_speed_rpm", self.flywheel_speed_rpm),
            ("chain_speed_rpm", self.chain_speed_rpm),
            ("torque", self.torque),
            ("generator_current", self.generator_current),
            ("grid_voltage", self.grid_voltage),
            ("grid_frequency", self.grid_frequency),
            ("power_factor", self.power_factor),
            ("thd_percent", self.thd_percent),
        ];
        if let Some((field, value)) = scalars.iter().find(|(_, value)| !value.is_finite()) {
            return Err(TransientError::InvalidSnapshot(format!(
                "{} is not finite ({})",
                field, value
            )));
        }
        if let Some((name, value)) = self
            .component_temperatures
            .iter()
            .find(|(_, value)| !value.is_finite())
        {
            return Err(TransientError::InvalidSnapshot(format!(
                "temperature '{}' is not finite ({})",
                name, value
            )));
        }
        if let Some(floater) = self
            .floaters
            .iter()
            .find(|floater| !floater.fill_progress.is_finite())
        {
            return Err(TransientError::InvalidSnapshot(format!(
                "floater {} fill_progress is not finite",
                floater.id
            )));
        }
        Ok(())
    }

    pub fn startup_inputs(&self) -> StartupInputs<'_> {
        StartupInputs {
            tank_pressure: self.pneumatics.tank_pressure,
            component_temperatures: &self.component_temperatures,
            floater_count: self.floaters.len(),
            flywheel_speed_rpm: self.flywheel_speed_rpm,
            chain_speed_rpm: self.chain_speed_rpm,
            grid_voltage: self.grid_voltage,
            grid_frequency: self.grid_frequency,
            grid_connected: self.grid_connected,
            readings_valid: self.validate().is_ok(),
        }
    }

    pub fn interlock_readings(&self) -> InterlockReadings {
        InterlockReadings {
            generator_current: self.generator_current,
            torque: self.torque,
            max_temperature: self.max_temperature().map(|(name, value)| (name.to_owned(), value)),
            tank_pressure: self.pneumatics.tank_pressure,
            flywheel_speed_rpm: self.flywheel_speed_rpm,
            grid_voltage: self.grid_voltage,
            grid_frequency: self.grid_frequency,
        }
    }

    pub fn grid_measurement(&self) -> GridMeasurement {
        GridMeasurement {
            frequency_hz: self.grid_frequency,
            voltage_v: self.grid_voltage,
            power_factor: self.power_factor,
            thd_percent: self.thd_percent,
            connected: self.grid_connected,
        }
    }
}

/// Readings the startup sequencer evaluates its advance predicates against.
#[derive(Debug, Clone, Copy)]
pub struct StartupInputs<'a> {
    pub tank_pressure: f64,
    pub component_temperatures: &'a IndexMap<String, f64>,
    pub floater_count: usize,
    pub flywheel_speed_rpm: f64,
    pub chain_speed_rpm: f64,
    pub grid_voltage: f64,
    pub grid_frequency: f64,
    pub grid_connected: bool,
    pub readings_valid: bool,
}

/// Measurements checked by the safety interlocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterlockReadings {
    pub generator_current: f64,
    pub torque: f64,
    /// Hottest component name and its temperature.
    pub max_temperature: Option<(String, f64)>,
    pub tank_pressure: f64,
    pub flywheel_speed_rpm: f64,
    pub grid_voltage: f64,
    pub grid_frequency: f64,
}

/// Point-of-common-coupling measurement handed to the grid handler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridMeasurement {
    pub frequency_hz: f64,
    pub voltage_v: f64,
    pub power_factor: f64,
    pub thd_percent: f64,
    pub connected: bool,
}

impl GridMeasurement {
    pub fn nominal(frequency_hz: f64, voltage_v: f64) -> Self {
        Self {
            frequency_hz,
            voltage_v,
            power_factor: 1.0,
            thd_percent: 0.0,
            connected: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_optional_readings_missing() {
        let snapshot: SystemSnapshot = serde_json::from_value(serde_json::json!({
            "time": 1.5,
            "pneumatics": { "tank_pressure": 4.2 },
            "component_temperatures": { "generator": 41.0, "compressor": 55.5 },
            "floaters": [{ "id": 1, "fill_progress": 0.4 }],
            "flywheel_speed_rpm": 120.0,
            "grid_voltage": 480.0,
            "grid_frequency": 60.0
        }))
        .unwrap();
        assert!(snapshot.grid_connected);
        assert_eq!(snapshot.power_factor, 1.0);
        assert_eq!(snapshot.max_temperature(), Some(("compressor", 55.5)));
        snapshot.validate().unwrap();
    }

    #[test]
    fn non_finite_readings_are_reported_by_field() {
        let mut snapshot = SystemSnapshot::at_rest(0.0, 480.0, 60.0);
        snapshot.flywheel_speed_rpm = f64::NAN;
        let err = snapshot.validate().unwrap_err();
        assert!(err.to_string().contains("flywheel_speed_rpm"));
        assert!(!snapshot.startup_inputs().readings_valid);
    }
}
