//! Per-device health: last observed state plus a consecutive failure counter.
//!
//! A device is working while `fails == 0`. There is no backoff and no upper
//! bound; every tick retries.

use chrono::Utc;
use log::{debug, info, warn};

use crate::models::mnet::{Device, Settings, Temperature};

/// Replaces the observed payload and resets the failure counter.
pub fn record_success(device: &mut Device, observed: Settings, inlet_temperature: Option<Temperature>) {
    if device.state.fails > 0 {
        info!(
            "Device {} is working again after {} failure(s)",
            device.name, device.state.fails
        );
    }
    debug!("Device {}: {}", device.name, observed.describe());
    device.state.settings = Some(observed);
    if inlet_temperature.is_some() {
        device.state.inlet_temperature = inlet_temperature;
    }
    device.state.fails = 0;
    device.state.updated_at = Some(Utc::now());
}

/// Counts a failed exchange. The last observed payload stays visible.
pub fn record_failure(device: &mut Device) {
    device.state.fails = device.state.fails.saturating_add(1);
    if device.state.fails == 1 {
        warn!("Device {} stopped working", device.name);
    }
}

pub fn is_working(device: &Device) -> bool {
    device.is_working()
}

/// Eligibility for matching and for adjusting "all" devices.
pub fn is_selected_and_working(device: &Device) -> bool {
    device.is_selected_and_working()
}
