//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use kpp_common::config::InterlockThresholds;
use kpp_common::time::SimSeconds;
use serde::{Deserialize, Serialize};

use crate::error::TransientError;
use crate::snapshot::InterlockReadings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockKind {
    ElectricalOverload,
    MechanicalFailure,
    ThermalOverload,
    Overpressure,
    Overspeed,
    Overvoltage,
    FrequencyDeviation,
}

impl InterlockKind {
    pub const ALL: [InterlockKind; 7] = [
        InterlockKind::ElectricalOverload,
        InterlockKind::MechanicalFailure,
        InterlockKind::ThermalOverload,
        InterlockKind::Overpressure,
        InterlockKind::Overspeed,
        InterlockKind::Overvoltage,
        InterlockKind::FrequencyDeviation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterlockKind::ElectricalOverload => "electrical_overload",
            InterlockKind::MechanicalFailure => "mechanical_failure",
            InterlockKind::ThermalOverload => "thermal_overload",
            InterlockKind::Overpressure => "overpressure",
            InterlockKind::Overspeed => "overspeed",
            InterlockKind::Overvoltage => "overvoltage",
            InterlockKind::FrequencyDeviation => "frequency_deviation",
        }
    }
}

impl fmt::Display for InterlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterlockKind {
    type Err = TransientError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        InterlockKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| TransientError::UnknownInterlock(value.to_owned()))
    }
}

/// Sticky latch for a single protective limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyInterlock {
    pub kind: InterlockKind,
    pub tripped: bool,
    pub limit: f64,
    pub trip_time: Option<SimSeconds>,
    pub trip_value: Option<f64>,
    pub reset_time: Option<SimSeconds>,
    pub trip_count: u32,
}

impl SafetyInterlock {
    fn new(kind: InterlockKind, limit: f64) -> Self {
        Self {
            kind,
            tripped: false,
            limit,
            trip_time: None,
            trip_value: None,
            reset_time: None,
            trip_count: 0,
        }
    }
}

/// A limit violation observed in one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitViolation {
    pub kind: InterlockKind,
    pub value: f64,
    pub limit: f64,
    pub detail: String,
}

/// The full set of interlocks and their thresholds.
#[derive(Debug, Clone)]
pub struct InterlockBank {
    thresholds: InterlockThresholds,
    interlocks: IndexMap<InterlockKind, SafetyInterlock>,
}

impl InterlockBank {
    pub fn new(thresholds: InterlockThresholds) -> Self {
        let mut bank = Self {
            thresholds,
            interlocks: IndexMap::new(),
        };
        for kind in InterlockKind::ALL {
            let limit = bank.limit(kind);
            bank.interlocks.insert(kind, SafetyInterlock::new(kind, limit));
        }
        bank
    }

    /// Trip threshold for `kind` in the unit of its measurement.
    pub fn limit(&self, kind: InterlockKind) -> f64 {
        let t = &self.thresholds;
        match kind {
            InterlockKind::ElectricalOverload => t.rated_current_a * t.overload_factor,
            InterlockKind::MechanicalFailure => t.rated_torque_nm * t.mechanical_failure_factor,
            InterlockKind::ThermalOverload => t.max_component_temperature_c,
            InterlockKind::Overpressure => t.max_tank_pressure_bar,
            InterlockKind::Overspeed => t.rated_speed_rpm * t.overspeed_factor,
            InterlockKind::Overvoltage => t.nominal.nominal_voltage_v * t.overvoltage_factor,
            InterlockKind::FrequencyDeviation => t.max_frequency_deviation_hz,
        }
    }

    /// Every limit currently exceeded by `readings`. Does not latch anything.
    pub fn evaluate(&self, readings: &InterlockReadings) -> Vec<LimitViolation> {
        let mut violations = Vec::new();
        let mut check = |kind: InterlockKind, value: f64, detail: String| {
            let limit = self.limit(kind);
            if value > limit {
                violations.push(LimitViolation {
                    kind,
                    value,
                    limit,
                    detail,
                });
            }
        };

        check(
            InterlockKind::ElectricalOverload,
            readings.generator_current,
            format!("generator current {:.1} A", readings.generator_current),
        );
        check(
            InterlockKind::MechanicalFailure,
            readings.torque,
            format!("drivetrain torque {:.1} N·m", readings.torque),
        );
        if let Some((component, temperature)) = &readings.max_temperature {
            check(
                InterlockKind::ThermalOverload,
                *temperature,
                format!("{} at {:.1} C", component, temperature),
            );
        }
        check(
            InterlockKind::Overpressure,
            readings.tank_pressure,
            format!("tank pressure {:.2} bar", readings.tank_pressure),
        );
        check(
            InterlockKind::Overspeed,
            readings.flywheel_speed_rpm,
            format!("flywheel speed {:.1} rpm", readings.flywheel_speed_rpm),
        );
        check(
            InterlockKind::Overvoltage,
            readings.grid_voltage,
            format!("grid voltage {:.1} V", readings.grid_voltage),
        );
        let deviation = (readings.grid_frequency - self.thresholds.nominal.nominal_frequency_hz).abs();
        check(
            InterlockKind::FrequencyDeviation,
            deviation,
            format!(
                "grid frequency {:.3} Hz, {:.3} Hz off nominal",
                readings.grid_frequency, deviation
            ),
        );
        violations
    }

    /// Latch the interlock named by `violation`. Returns true only when it was
    /// not already tripped.
    pub fn latch(&mut self, violation: &LimitViolation, now: SimSeconds) -> bool {
        let Some(interlock) = self.interlocks.get_mut(&violation.kind) else {
            return false;
        };
        if interlock.tripped {
            return false;
        }
        interlock.tripped = true;
        interlock.trip_time = Some(now);
        interlock.trip_value = Some(violation.value);
        interlock.trip_count += 1;
        true
    }

    /// Clear the latch. Returns true when the interlock had been tripped.
    pub fn reset(&mut self, kind: InterlockKind, now: SimSeconds) -> bool {
        let Some(interlock) = self.interlocks.get_mut(&kind) else {
            return false;
        };
        if !interlock.tripped {
            return false;
        }
        interlock.tripped = false;
        interlock.reset_time = Some(now);
        true
    }

    pub fn is_tripped(&self, kind: InterlockKind) -> bool {
        self.interlocks
            .get(&kind)
            .map(|interlock| interlock.tripped)
            .unwrap_or(false)
    }

    pub fn tripped(&self) -> Vec<InterlockKind> {
        self.interlocks
            .values()
            .filter(|interlock| interlock.tripped)
            .map(|interlock| interlock.kind)
            .collect()
    }

    pub fn get(&self, kind: InterlockKind) -> Option<&SafetyInterlock> {
        self.interlocks.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SafetyInterlock> {
        self.interlocks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> InterlockReadings {
        InterlockReadings {
            generator_current: 50.0,
            torque: 800.0,
            max_temperature: Some(("generator".into(), 45.0)),
            tank_pressure: 5.0,
            flywheel_speed_rpm: 375.0,
            grid_voltage: 480.0,
            grid_frequency: 60.0,
        }
    }

    #[test]
    fn default_limits_follow_rated_values() {
        let bank = InterlockBank::new(InterlockThresholds::default());
        assert!((bank.limit(InterlockKind::Overspeed) - 495.0).abs() < 1e-9);
        assert!((bank.limit(InterlockKind::ElectricalOverload) - 120.0).abs() < 1e-9);
        assert!((bank.limit(InterlockKind::Overvoltage) - 528.0).abs() < 1e-9);
        assert!(bank.evaluate(&healthy()).is_empty());
    }

    #[test]
    fn latch_is_sticky_until_reset() {
        let mut bank = InterlockBank::new(InterlockThresholds::default());
        let mut readings = healthy();
        readings.flywheel_speed_rpm = 500.0;
        let violations = bank.evaluate(&readings);
        assert_eq!(violations.len(), 1);
        assert!(bank.latch(&violations[0], 1.0));
        assert!(!bank.latch(&violations[0], 2.0));
        assert!(bank.is_tripped(InterlockKind::Overspeed));

        // Back in limits: nothing clears the latch on its own.
        assert!(bank.evaluate(&healthy()).is_empty());
        assert!(bank.is_tripped(InterlockKind::Overspeed));

        assert!(bank.reset(InterlockKind::Overspeed, 3.0));
        assert!(!bank.reset(InterlockKind::Overspeed, 3.5));
        let record = bank.get(InterlockKind::Overspeed).unwrap();
        assert_eq!(record.trip_count, 1);
        assert_eq!(record.reset_time, Some(3.0));
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!(
            " Thermal_Overload".parse::<InterlockKind>().unwrap(),
            InterlockKind::ThermalOverload
        );
        assert!(matches!(
            "flux".parse::<InterlockKind>(),
            Err(TransientError::UnknownInterlock(_))
        ));
    }
}
