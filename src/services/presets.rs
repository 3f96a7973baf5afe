//! Decides which presets are currently active.

use log::debug;
use std::str::FromStr;

use crate::models::mnet::{Device, Preset, State};
use crate::registry::Registry;

/// How many eligible devices must report a preset's settings for it to be active.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum MatchRule {
    /// Every eligible device matches.
    #[default]
    All,
    /// At least one eligible device matches.
    Any,
}

impl FromStr for MatchRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(MatchRule::All),
            "any" => Ok(MatchRule::Any),
            other => Err(format!("unknown match rule {:?} (expected \"all\" or \"any\")", other)),
        }
    }
}

/// States of every enabled, effectively selected and working device.
pub fn eligible_states(devices: &[Device]) -> Vec<&State> {
    devices
        .iter()
        .filter(|d| d.enabled && d.is_selected_and_working())
        .map(|d| &d.state)
        .collect()
}

/// An empty eligible set never matches. Ties are not resolved.
pub fn is_matching(preset: &Preset, states: &[&State], rule: MatchRule) -> bool {
    if states.is_empty() {
        return false;
    }
    let matches = |s: &&State| s.settings.as_ref() == Some(&preset.settings);
    match rule {
        MatchRule::All => states.iter().all(matches),
        MatchRule::Any => states.iter().any(matches),
    }
}

/// Recomputes every preset's `active` flag. Returns the number of active presets.
pub fn update_presets(registry: &mut Registry, rule: MatchRule) -> usize {
    let states = eligible_states(&registry.devices);
    let mut active = 0;
    for preset in registry.presets.iter_mut() {
        preset.active = is_matching(preset, &states, rule);
        if preset.active {
            active += 1;
        }
    }
    debug!(
        "Preset match over {} eligible device(s): {} of {} preset(s) active",
        states.len(),
        active,
        registry.presets.len()
    );
    active
}
