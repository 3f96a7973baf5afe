//! Canonical device and preset lists.
//!
//! The registry is loaded from a JSON file at startup. At runtime it is shared
//! between the foreground and the worker; only the worker writes device state
//! and preset flags, and it never holds the lock across network I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::mnet::{Device, DeviceId, Preset, PresetId};

pub type SharedRegistry = Arc<Mutex<Registry>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub presets: Vec<Preset>,
}

impl Registry {
    pub fn new(devices: Vec<Device>, presets: Vec<Preset>) -> Self {
        Registry { devices, presets }
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn device_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| &d.id == id)
    }

    pub fn preset(&self, id: &PresetId) -> Option<&Preset> {
        self.presets.iter().find(|p| &p.id == id)
    }

    pub fn active_presets(&self) -> impl Iterator<Item = &Preset> {
        self.presets.iter().filter(|p| p.active)
    }

    pub fn is_any_device_enabled_and_working(&self) -> bool {
        self.devices.iter().any(|d| d.enabled && d.is_working())
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let de = &mut serde_json::Deserializer::from_str(json);
        let registry: Registry =
            serde_path_to_error::deserialize(de).map_err(|e| format!("invalid registry at {}: {}", e.path(), e.inner()))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let json = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_json(&json).map_err(|e| format!("{}: {}", path.display(), e))
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for d in &self.devices {
            if !seen.insert(&d.id.0) {
                return Err(format!("duplicate device id {:?}", d.id.0));
            }
        }
        let mut seen = HashSet::new();
        for p in &self.presets {
            if !seen.insert(&p.id.0) {
                return Err(format!("duplicate preset id {:?}", p.id.0));
            }
        }
        Ok(())
    }
}

/// Locks the shared registry. A panic on another thread does not leave it unusable.
pub fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
