//! ---
//! kpp_section: "05-transient-coordination"
//! kpp_subsection: "module"
//! kpp_type: "source"
//! kpp_scope: "code"
//! kpp_description: "Supervisory state machines for plant transients."
//! kpp_version: "v0.0.0-prealpha"
//! kpp_owner: "tbd"
//! ---
//! Actuator directive groups. Every directive is optional: an unset field means
//! "no opinion", so groups from several sources can be layered with
//! [`CommandSet::overlay`] and serialise as sparse maps.

use serde::{Deserialize, Serialize};

macro_rules! overlay_fields {
    ($target:expr, $source:expr; $($field:ident),+ $(,)?) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field;
            }
        )+
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PneumaticCommands {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressor_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection_enabled: Option<bool>,
    /// Tank pressure setpoint in bar.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_setpoint: Option<f64>,
    /// Floater injection rate in Hz.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection_frequency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vent_valves_open: Option<bool>,
}

impl PneumaticCommands {
    fn overlay(&mut self, other: &Self) {
        overlay_fields!(self, other;
            compressor_enabled,
            injection_enabled,
            pressure_setpoint,
            injection_frequency,
            vent_valves_open,
        );
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectricalCommands {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator_enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_connect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronization_enable: Option<bool>,
    /// Electrical load as a fraction of rated, `0.0..=1.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_factor: Option<f64>,
    /// Active power correction in percent of rated output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_adjustment_pct: Option<f64>,
    /// Reactive power correction in percent of rated output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactive_power_adjustment_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harmonic_filter_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_factor_correction: Option<bool>,
    /// Fraction of connected load to shed, `0.0..=1.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_shed_fraction: Option<f64>,
}

impl ElectricalCommands {
    fn overlay(&mut self, other: &Self) {
        overlay_fields!(self, other;
            generator_enable,
            grid_connect,
            synchronization_enable,
            load_factor,
            power_adjustment_pct,
            reactive_power_adjustment_pct,
            harmonic_filter_enabled,
            power_factor_correction,
            load_shed_fraction,
        );
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MechanicalCommands {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanical_brake: Option<bool>,
}

impl MechanicalCommands {
    fn overlay(&mut self, other: &Self) {
        overlay_fields!(self, other; mechanical_brake);
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlCommands {
    /// Flywheel speed setpoint in rpm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_setpoint: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damping_control: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub damping_gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub islanded_mode: Option<bool>,
}

impl ControlCommands {
    fn overlay(&mut self, other: &Self) {
        overlay_fields!(self, other; speed_setpoint, damping_control, damping_gain, islanded_mode);
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Directive groups addressed to the plant actuators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    #[serde(skip_serializing_if = "PneumaticCommands::is_empty")]
    pub pneumatic: PneumaticCommands,
    #[serde(skip_serializing_if = "ElectricalCommands::is_empty")]
    pub electrical: ElectricalCommands,
    #[serde(skip_serializing_if = "MechanicalCommands::is_empty")]
    pub mechanical: MechanicalCommands,
    #[serde(skip_serializing_if = "ControlCommands::is_empty")]
    pub control: ControlCommands,
}

impl CommandSet {
    pub fn is_empty(&self) -> bool {
        self.pneumatic.is_empty()
            && self.electrical.is_empty()
            && self.mechanical.is_empty()
            && self.control.is_empty()
    }

    /// Copy every directive `other` sets on top of `self`.
    pub fn overlay(&mut self, other: &CommandSet) {
        self.pneumatic.overlay(&other.pneumatic);
        self.electrical.overlay(&other.electrical);
        self.mechanical.overlay(&other.mechanical);
        self.control.overlay(&other.control);
    }

    /// Return a copy of `self` with `other` layered on top.
    pub fn layered(mut self, other: &CommandSet) -> CommandSet {
        self.overlay(other);
        self
    }

    /// Plant fully stopped: pneumatics off and vented, generator off the grid,
    /// brake engaged.
    pub fn safe_stop() -> Self {
        EmergencyDirectives::all().to_command_set()
    }

    /// Plant idle and held: nothing running, brake engaged, vents closed.
    pub fn idle_hold() -> Self {
        Self {
            pneumatic: PneumaticCommands {
                compressor_enabled: Some(false),
                injection_enabled: Some(false),
                ..PneumaticCommands::default()
            },
            electrical: ElectricalCommands {
                generator_enable: Some(false),
                grid_connect: Some(false),
                synchronization_enable: Some(false),
                ..ElectricalCommands::default()
            },
            mechanical: MechanicalCommands {
                mechanical_brake: Some(true),
            },
            control: ControlCommands::default(),
        }
    }
}

/// Coarse fail-safe directives asserted by a failed startup or a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyDirectives {
    pub pneumatic_stop: bool,
    pub electrical_disconnect: bool,
    pub mechanical_brake: bool,
}

impl EmergencyDirectives {
    pub const fn all() -> Self {
        Self {
            pneumatic_stop: true,
            electrical_disconnect: true,
            mechanical_brake: true,
        }
    }

    pub fn any(&self) -> bool {
        self.pneumatic_stop || self.electrical_disconnect || self.mechanical_brake
    }

    /// Expand the coarse directives into actuator commands.
    pub fn to_command_set(&self) -> CommandSet {
        let mut commands = CommandSet::default();
        if self.pneumatic_stop {
            commands.pneumatic = PneumaticCommands {
                compressor_enabled: Some(false),
                injection_enabled: Some(false),
                injection_frequency: Some(0.0),
                vent_valves_open: Some(true),
                pressure_setpoint: None,
            };
        }
        if self.electrical_disconnect {
            commands.electrical.generator_enable = Some(false);
            commands.electrical.grid_connect = Some(false);
            commands.electrical.synchronization_enable = Some(false);
            commands.electrical.load_factor = Some(0.0);
        }
        if self.mechanical_brake {
            commands.mechanical.mechanical_brake = Some(true);
            commands.control.speed_setpoint = Some(0.0);
        }
        commands
    }

    pub fn merge(self, other: EmergencyDirectives) -> Self {
        Self {
            pneumatic_stop: self.pneumatic_stop || other.pneumatic_stop,
            electrical_disconnect: self.electrical_disconnect || other.electrical_disconnect,
            mechanical_brake: self.mechanical_brake || other.mechanical_brake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_only_replaces_set_directives() {
        let mut base = CommandSet::default();
        base.pneumatic.compressor_enabled = Some(true);
        base.pneumatic.pressure_setpoint = Some(5.0);
        base.electrical.grid_connect = Some(true);

        let mut patch = CommandSet::default();
        patch.electrical.grid_connect = Some(false);
        patch.mechanical.mechanical_brake = Some(true);

        let merged = base.layered(&patch);
        assert_eq!(merged.pneumatic.compressor_enabled, Some(true));
        assert_eq!(merged.pneumatic.pressure_setpoint, Some(5.0));
        assert_eq!(merged.electrical.grid_connect, Some(false));
        assert_eq!(merged.mechanical.mechanical_brake, Some(true));
    }

    #[test]
    fn serialises_as_sparse_nested_maps() {
        let value = serde_json::to_value(CommandSet::safe_stop()).unwrap();
        assert_eq!(value["mechanical"]["mechanical_brake"], true);
        assert_eq!(value["electrical"]["grid_connect"], false);
        assert!(value["pneumatic"].get("pressure_setpoint").is_none());

        let empty = serde_json::to_value(CommandSet::default()).unwrap();
        assert_eq!(empty, serde_json::json!({}));
    }

    #[test]
    fn partial_directives_leave_other_groups_untouched() {
        let directives = EmergencyDirectives {
            electrical_disconnect: true,
            ..EmergencyDirectives::default()
        };
        let commands = directives.to_command_set();
        assert_eq!(commands.electrical.grid_connect, Some(false));
        assert!(commands.pneumatic.compressor_enabled.is_none());
        assert!(commands.mechanical.mechanical_brake.is_none());
    }
}
