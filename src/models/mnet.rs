//! Domain types for M-NET air conditioners and presets.
//!
//! Wire tokens (`ON`, `COOL`, `MID2`, ...) are part of the controller's fixed
//! XML vocabulary; `as_str` and `FromStr` are the only places they are spelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::{combine, surround};

// =====================
// Identifiers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresetId(pub String);

/// Protocol dialect selector of a device (the controller's EC number).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ec(pub u8);

impl Ec {
    /// Value of the `Ec` attribute on the wire.
    pub fn key(self) -> String {
        self.0.to_string()
    }

    pub fn label(self) -> String {
        format!("EC{}", self.0)
    }
}

// =====================
// Wire enums
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseValueError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} value: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseValueError {}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $token:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $token)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $token),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ParseValueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($token => Ok(Self::$variant),)+
                    other => Err(ParseValueError { kind: $kind, value: other.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(
    /// Power state (`Drive` attribute).
    Drive, "drive", {
        On => "ON",
        Off => "OFF",
    }
);

wire_enum!(
    /// Operation mode (`Mode` attribute).
    Mode, "mode", {
        Fan => "FAN",
        Cool => "COOL",
        Heat => "HEAT",
        Dry => "DRY",
        Auto => "AUTO",
        AutoCool => "AUTOCOOL",
        AutoHeat => "AUTOHEAT",
    }
);

wire_enum!(
    /// Fan speed (`FanSpeed` attribute).
    FanSpeed, "fan speed", {
        Low => "LOW",
        Mid2 => "MID2",
        Mid1 => "MID1",
        High => "HIGH",
        Auto => "AUTO",
    }
);

wire_enum!(
    /// Vane position (`AirDirection` attribute).
    AirDirection, "air direction", {
        Swing => "SWING",
        Vertical => "VERTICAL",
        Mid2 => "MID2",
        Mid1 => "MID1",
        Horizontal => "HORIZONTAL",
        Auto => "AUTO",
    }
);

/// How the indoor unit is mounted. Cosmetic only.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Installation {
    #[default]
    Standing,
    Wall,
    Ceiling,
    Cassette,
}

/// Temperature in tenths of a degree Celsius.
///
/// Kept integral so settings compare structurally without float noise.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Temperature(i16);

impl Temperature {
    pub fn from_tenths(tenths: i16) -> Self {
        Temperature(tenths)
    }

    pub fn tenths(self) -> i16 {
        self.0
    }

    pub fn celsius(self) -> f64 {
        f64::from(self.0) / 10.0
    }
}

impl TryFrom<f64> for Temperature {
    type Error = ParseValueError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let tenths = (value * 10.0).round();
        if !tenths.is_finite() || tenths < f64::from(i16::MIN) || tenths > f64::from(i16::MAX) {
            return Err(ParseValueError {
                kind: "temperature",
                value: value.to_string(),
            });
        }
        Ok(Temperature(tenths as i16))
    }
}

impl From<Temperature> for f64 {
    fn from(value: Temperature) -> Self {
        value.celsius()
    }
}

impl FromStr for Temperature {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseValueError {
            kind: "temperature",
            value: s.to_string(),
        };
        let value = s.trim().parse::<f64>().map_err(|_| invalid())?;
        Temperature::try_from(value).map_err(|_| invalid())
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{}", sign, abs / 10, abs % 10)
    }
}

// =====================
// Settings / state
// =====================

/// The operating parameters a preset targets and a poll observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Settings {
    pub drive: Drive,
    pub mode: Mode,
    pub temperature: Temperature,
    pub fan: FanSpeed,
    pub air: AirDirection,
}

impl Settings {
    pub fn describe(&self) -> String {
        match self.drive {
            Drive::Off => Drive::Off.to_string(),
            Drive::On => format!(
                "{} {} {}°C fan {} air {}",
                self.drive, self.mode, self.temperature, self.fan, self.air
            ),
        }
    }
}

/// Last observed state of a device plus its consecutive failure counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    /// Last successfully reported settings. Left untouched by failures.
    pub settings: Option<Settings>,
    /// Room temperature measured at the unit's inlet, if reported.
    pub inlet_temperature: Option<Temperature>,
    pub fails: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl State {
    pub fn is_working(&self) -> bool {
        self.fails == 0
    }

    pub fn describe(&self) -> String {
        let settings = self
            .settings
            .as_ref()
            .map(Settings::describe)
            .unwrap_or_else(|| "unknown".to_string());
        if self.is_working() {
            settings
        } else {
            format!("{} (not working, {} failure(s))", settings, self.fails)
        }
    }
}

/// Cached addressing group of a device on its bus.
///
/// The group is only valid for the host/address pair it was reported for.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum AddressResolution {
    /// Never resolved since the device was loaded.
    #[default]
    Unresolved,
    Resolved(u32),
    /// Host or address changed after a group had been cached.
    NeedsRediscovery,
}

impl AddressResolution {
    pub fn group(self) -> Option<u32> {
        match self {
            AddressResolution::Resolved(group) => Some(group),
            AddressResolution::Unresolved | AddressResolution::NeedsRediscovery => None,
        }
    }
}

// =====================
// Device / preset
// =====================

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub installation: Installation,
    #[serde(default)]
    host: String,
    #[serde(default)]
    pub ec: Option<Ec>,
    #[serde(default)]
    address: Option<u32>,
    #[serde(skip)]
    resolution: AddressResolution,
    #[serde(default = "default_true")]
    pub selected: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Model string last reported by the unit.
    #[serde(skip)]
    pub model: Option<String>,
    #[serde(skip)]
    pub state: State,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        ec: Option<Ec>,
        address: Option<u32>,
    ) -> Self {
        Device {
            id: DeviceId(id.into()),
            name: name.into(),
            installation: Installation::default(),
            host: host.into(),
            ec,
            address,
            resolution: AddressResolution::Unresolved,
            selected: true,
            enabled: true,
            model: None,
            state: State::default(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if self.host != host {
            self.host = host;
            self.resolution = AddressResolution::NeedsRediscovery;
        }
    }

    pub fn address(&self) -> Option<u32> {
        self.address
    }

    pub fn set_address(&mut self, address: Option<u32>) {
        if self.address != address {
            self.address = address;
            self.resolution = AddressResolution::NeedsRediscovery;
        }
    }

    pub fn resolution(&self) -> AddressResolution {
        self.resolution
    }

    pub fn group(&self) -> Option<u32> {
        self.resolution.group()
    }

    /// Caches the group reported by the unit. Only the orchestrator calls this.
    pub(crate) fn resolve_group(&mut self, group: u32) {
        self.resolution = AddressResolution::Resolved(group);
    }

    /// Effective selection: a disabled device is never selected.
    pub fn is_selected(&self) -> bool {
        self.selected && self.enabled
    }

    pub fn is_working(&self) -> bool {
        self.state.is_working()
    }

    pub fn is_selected_and_working(&self) -> bool {
        self.is_selected() && self.is_working()
    }

    pub fn describe_state(&self) -> String {
        combine(": ", [self.name.as_str(), self.state.describe().as_str()])
    }

    pub fn describe_settings(&self) -> String {
        let target = if !self.enabled {
            "disabled".to_string()
        } else {
            crate::client::device_url(&self.host).unwrap_or_else(|_| self.host.clone())
        };
        let ec = self.ec.map(Ec::label).unwrap_or_default();
        let address = self.address.map(|a| a.to_string()).unwrap_or_default();
        let bus = surround("[", &combine(" ", [ec.as_str(), address.as_str()]), "]");
        combine(": ", [self.name.as_str(), combine(" ", [target.as_str(), bus.as_str()]).as_str()])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: PresetId,
    pub name: String,
    pub settings: Settings,
    /// Recomputed by every matching pass.
    #[serde(skip)]
    pub active: bool,
}

impl Preset {
    pub fn new(id: impl Into<String>, name: impl Into<String>, settings: Settings) -> Self {
        Preset {
            id: PresetId(id.into()),
            name: name.into(),
            settings,
            active: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("d1", "Office", "10.0.0.5", Some(Ec(1)), Some(5))
    }

    #[test]
    fn host_change_requires_rediscovery() {
        let mut d = device();
        d.resolve_group(3);
        assert_eq!(d.group(), Some(3));

        d.set_host("10.0.0.6");
        assert_eq!(d.resolution(), AddressResolution::NeedsRediscovery);
        assert_eq!(d.group(), None);
    }

    #[test]
    fn address_change_requires_rediscovery_even_when_unresolved() {
        let mut d = device();
        d.set_address(Some(6));
        assert_eq!(d.resolution(), AddressResolution::NeedsRediscovery);

        d.resolve_group(1);
        d.set_address(None);
        assert_eq!(d.group(), None);
    }

    #[test]
    fn unchanged_host_keeps_group() {
        let mut d = device();
        d.resolve_group(2);
        d.set_host("10.0.0.5");
        d.set_address(Some(5));
        assert_eq!(d.resolution(), AddressResolution::Resolved(2));
    }

    #[test]
    fn disabled_device_is_never_selected() {
        let mut d = device();
        assert!(d.is_selected());
        d.enabled = false;
        assert!(!d.is_selected());
        assert!(!d.is_selected_and_working());
    }

    #[test]
    fn temperature_parses_and_formats_tenths() {
        let t: Temperature = "22.5".parse().expect("valid temperature");
        assert_eq!(t.tenths(), 225);
        assert_eq!(t.to_string(), "22.5");
        assert_eq!(Temperature::from_tenths(-15).to_string(), "-1.5");
        assert_eq!(Temperature::from_tenths(200).to_string(), "20.0");
        assert!("warm".parse::<Temperature>().is_err());
    }

    #[test]
    fn wire_tokens_are_stable() {
        assert_eq!(Mode::AutoCool.as_str(), "AUTOCOOL");
        assert_eq!("MID2".parse::<FanSpeed>(), Ok(FanSpeed::Mid2));
        assert_eq!("MID2".parse::<AirDirection>(), Ok(AirDirection::Mid2));
        let err = "BOOST".parse::<FanSpeed>().unwrap_err();
        assert_eq!(err.kind, "fan speed");
    }

    #[test]
    fn describe_settings_marks_disabled_devices() {
        let mut d = device();
        assert_eq!(
            d.describe_settings(),
            "Office: http://10.0.0.5/servlet/MIMEReceiveServlet [EC1 5]"
        );
        d.enabled = false;
        assert_eq!(d.describe_settings(), "Office: disabled [EC1 5]");
    }
}
