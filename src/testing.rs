//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use crate::models::mnet::{AirDirection, Device, Drive, Ec, FanSpeed, Mode, Settings, Temperature};
use crate::registry::Registry;
use crate::services::devices::StateListener;

pub fn cool_22() -> Settings {
    Settings {
        drive: Drive::On,
        mode: Mode::Cool,
        temperature: Temperature::from_tenths(220),
        fan: FanSpeed::Auto,
        air: AirDirection::Swing,
    }
}

pub fn heat_20() -> Settings {
    Settings {
        drive: Drive::On,
        mode: Mode::Heat,
        temperature: Temperature::from_tenths(200),
        fan: FanSpeed::Low,
        air: AirDirection::Horizontal,
    }
}

/// Enabled, selected device on `10.0.0.5`, EC 1. The name equals the id.
pub fn device(id: &str, address: u32) -> Device {
    Device::new(id, id, "10.0.0.5", Some(Ec(1)), Some(address))
}

/// Remembers which presets were active at each refresh.
#[derive(Clone, Default)]
pub struct RecordingListener {
    seen: Arc<Mutex<Vec<Vec<String>>>>,
}

impl RecordingListener {
    pub fn refreshes(&self) -> usize {
        self.seen.lock().expect("listener lock").len()
    }

    pub fn last_active(&self) -> Option<Vec<String>> {
        self.seen.lock().expect("listener lock").last().cloned()
    }
}

impl StateListener for RecordingListener {
    fn refresh(&self, registry: &Registry) {
        let active = registry.active_presets().map(|p| p.id.0.clone()).collect();
        self.seen.lock().expect("listener lock").push(active);
    }
}
