//! Polls and adjusts devices, feeding outcomes into the health tracker.
//!
//! All methods run on the scheduler's worker. Device configuration is copied
//! out of the registry before any request is sent; outcomes are written back
//! only if the device's host and address did not change in the meantime.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;

use crate::client::{Transport, TransportError};
use crate::health::{record_failure, record_success};
use crate::models::mnet::{Device, DeviceId, Preset, Settings};
use crate::protocol::{self, Item, ItemError, ProtocolError, RequestError};
use crate::registry::{self, Registry, SharedRegistry};
use crate::services::presets::{self, MatchRule};

#[derive(Debug, Clone)]
pub enum MnetError {
    Config(RequestError),
    Transport(String),
    Protocol(ProtocolError),
    UnknownDevice(DeviceId),
}

impl fmt::Display for MnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MnetError::Config(e) => write!(f, "configuration error: {}", e),
            MnetError::Transport(e) => write!(f, "{}", e),
            MnetError::Protocol(e) => write!(f, "protocol error: {}", e),
            MnetError::UnknownDevice(id) => write!(f, "unknown device {:?}", id.0),
        }
    }
}

impl std::error::Error for MnetError {}

impl From<RequestError> for MnetError {
    fn from(value: RequestError) -> Self {
        MnetError::Config(value)
    }
}

impl From<TransportError> for MnetError {
    fn from(value: TransportError) -> Self {
        MnetError::Transport(value.to_string())
    }
}

impl From<ProtocolError> for MnetError {
    fn from(value: ProtocolError) -> Self {
        MnetError::Protocol(value)
    }
}

/// Receives the registry after every matching pass, e.g. to repaint a UI.
pub trait StateListener: Send {
    fn refresh(&self, registry: &Registry);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub working: usize,
    pub failed: usize,
    /// Outcomes dropped because the device was reconfigured or removed mid-flight.
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    Applied,
    /// The device is disabled; nothing was sent.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdjustSummary {
    pub applied: usize,
    pub failed: usize,
}

pub struct DeviceService {
    transport: Box<dyn Transport>,
    registry: SharedRegistry,
    match_rule: MatchRule,
    listener: Option<Box<dyn StateListener>>,
}

impl DeviceService {
    pub fn new(transport: Box<dyn Transport>, registry: SharedRegistry, match_rule: MatchRule) -> Self {
        DeviceService {
            transport,
            registry,
            match_rule,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn StateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// One tick: poll every device, then recompute presets and notify.
    pub fn update(&self) -> PollSummary {
        debug!("Updating");
        let summary = self.poll_all();
        self.update_presets();
        summary
    }

    /// Polls every configured device, selected or not.
    pub fn poll_all(&self) -> PollSummary {
        let snapshot = registry::lock(&self.registry).devices.clone();
        self.poll(&snapshot)
    }

    /// Polls a single device without running a matching pass.
    pub fn poll_device(&self, id: &DeviceId) -> Result<PollSummary, MnetError> {
        let device = registry::lock(&self.registry)
            .device(id)
            .cloned()
            .ok_or_else(|| MnetError::UnknownDevice(id.clone()))?;
        Ok(self.poll(std::slice::from_ref(&device)))
    }

    fn poll(&self, devices: &[Device]) -> PollSummary {
        let mut outcomes: Vec<(&Device, Result<Item, MnetError>)> = Vec::with_capacity(devices.len());

        // One request per controller host; invalid devices never reach the wire.
        let mut batches: BTreeMap<&str, Vec<&Device>> = BTreeMap::new();
        for device in devices {
            match protocol::device_item(device) {
                Ok(_) => batches.entry(device.host().trim()).or_default().push(device),
                Err(e) => outcomes.push((device, Err(e.into()))),
            }
        }

        for (host, batch) in batches {
            match self.exchange_info(host, &batch) {
                Ok(items) => {
                    for device in batch {
                        let address = device.address().unwrap_or_default();
                        let result = match protocol::find_item_result(&items, address) {
                            Some(Ok(item)) => Ok(item.clone()),
                            Some(Err(e)) => Err(MnetError::Protocol(e.clone())),
                            None => Err(MnetError::Protocol(ProtocolError::NoMatchingItem { address })),
                        };
                        outcomes.push((device, result));
                    }
                }
                Err(e) => {
                    for device in batch {
                        outcomes.push((device, Err(e.clone())));
                    }
                }
            }
        }

        let mut summary = PollSummary::default();
        let mut registry = registry::lock(&self.registry);
        let mut resolved = Vec::new();
        for (snapshot, result) in outcomes {
            let Some(device) = current(&mut registry, snapshot) else {
                summary.discarded += 1;
                continue;
            };
            match result {
                Ok(item) => {
                    apply_item(device, &item);
                    if device.is_working() {
                        summary.working += 1;
                    } else {
                        summary.failed += 1;
                    }
                    if let Some(group) = item.group {
                        resolved.push((device.id.clone(), group));
                    }
                }
                Err(e) => {
                    warn!("Poll: device {} failed: {}", device.name, e);
                    record_failure(device);
                    summary.failed += 1;
                }
            }
        }

        // Groups are cached once all outcomes are in.
        for (id, group) in resolved {
            if let Some(device) = registry.device_mut(&id)
                && device.group() != Some(group)
            {
                debug!("Poll: device {} resolved to group {}", device.name, group);
                device.resolve_group(group);
            }
        }

        debug!(
            "Poll: {} working, {} failed, {} discarded",
            summary.working, summary.failed, summary.discarded
        );
        summary
    }

    /// A transport failure or an unusable document fails the whole batch;
    /// a bad item only fails the device it belongs to.
    fn exchange_info(&self, host: &str, batch: &[&Device]) -> Result<Vec<Result<Item, ItemError>>, MnetError> {
        let request = protocol::build_info_request(batch)?;
        let response = self.transport.exchange(host, &request)?;
        Ok(protocol::decode_response_items(&response)?)
    }

    /// Pushes `preset` to one device, then runs a matching pass whatever the outcome.
    pub fn adjust(&self, id: &DeviceId, preset: &Preset) -> Result<AdjustOutcome, MnetError> {
        let result = self.adjust_device(id, preset);
        self.update_presets();
        result
    }

    /// Adjusts every effectively selected device, one after another.
    pub fn adjust_all(&self, preset: &Preset) -> AdjustSummary {
        let ids: Vec<DeviceId> = registry::lock(&self.registry)
            .devices
            .iter()
            .filter(|d| d.enabled && d.is_selected())
            .map(|d| d.id.clone())
            .collect();
        info!("Adjust: applying preset {} to {} device(s)", preset.name, ids.len());

        let mut summary = AdjustSummary::default();
        for id in &ids {
            match self.adjust(id, preset) {
                Ok(AdjustOutcome::Applied) => summary.applied += 1,
                Ok(AdjustOutcome::Skipped) => {}
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    fn adjust_device(&self, id: &DeviceId, preset: &Preset) -> Result<AdjustOutcome, MnetError> {
        let snapshot = registry::lock(&self.registry)
            .device(id)
            .cloned()
            .ok_or_else(|| MnetError::UnknownDevice(id.clone()))?;
        if !snapshot.enabled {
            debug!("Adjust: device {} is not enabled", snapshot.name);
            return Ok(AdjustOutcome::Skipped);
        }

        info!("Adjust: device {} to preset {}", snapshot.name, preset.name);
        match self.exchange_adjust(&snapshot, &preset.settings) {
            Ok(item) if item.settings.is_some() => {
                let mut registry = registry::lock(&self.registry);
                if let Some(device) = current(&mut registry, &snapshot) {
                    apply_item(device, &item);
                }
                Ok(AdjustOutcome::Applied)
            }
            Ok(_) => {
                debug!("Adjust: device {} acknowledged without state, polling", snapshot.name);
                self.poll(std::slice::from_ref(&snapshot));
                Ok(AdjustOutcome::Applied)
            }
            Err(e) => {
                warn!("Adjust: device {} failed: {}", snapshot.name, e);
                let mut registry = registry::lock(&self.registry);
                if let Some(device) = current(&mut registry, &snapshot) {
                    record_failure(device);
                }
                Err(e)
            }
        }
    }

    fn exchange_adjust(&self, device: &Device, settings: &Settings) -> Result<Item, MnetError> {
        let request = protocol::build_adjust_request(device, settings)?;
        let response = self.transport.exchange(device.host().trim(), &request)?;
        let items = protocol::decode_response(&response)?;
        let address = device.address().unwrap_or_default();
        protocol::find_item(&items, address)
            .cloned()
            .ok_or(MnetError::Protocol(ProtocolError::NoMatchingItem { address }))
    }

    /// Recomputes preset flags from the current registry and notifies the listener.
    pub fn update_presets(&self) -> usize {
        let mut registry = registry::lock(&self.registry);
        let active = presets::update_presets(&mut registry, self.match_rule);
        if let Some(listener) = &self.listener {
            listener.refresh(&registry);
        }
        active
    }
}

/// The registry entry for `snapshot`, if it still has the same addressing.
fn current<'a>(registry: &'a mut Registry, snapshot: &Device) -> Option<&'a mut Device> {
    match registry.device_mut(&snapshot.id) {
        Some(device) if device.host() == snapshot.host() && device.address() == snapshot.address() => Some(device),
        Some(device) => {
            debug!("Device {} was reconfigured while in flight, discarding outcome", device.name);
            None
        }
        None => None,
    }
}

/// Applies a response item; an item without full state counts as a failure.
fn apply_item(device: &mut Device, item: &Item) {
    if let Some(model) = &item.model {
        device.model = Some(model.clone());
    }
    match &item.settings {
        Some(settings) => record_success(device, settings.clone(), item.inlet_temperature),
        None => {
            warn!("Device {} answered without its state", device.name);
            record_failure(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mnet::{AddressResolution, Ec, PresetId};
    use crate::protocol::{GET_REQUEST, SET_REQUEST};
    use crate::services::simulator::SimulatedController;
    use crate::testing::{RecordingListener, cool_22, device, heat_20};

    const HOST: &str = "10.0.0.5";

    fn service_with(devices: Vec<Device>, presets: Vec<Preset>) -> (DeviceService, SimulatedController) {
        let sim = SimulatedController::new(7);
        let registry = Registry::new(devices, presets).into_shared();
        let service = DeviceService::new(Box::new(sim.clone()), registry, MatchRule::All);
        (service, sim)
    }

    /// Answers every request with the same document.
    struct CannedTransport(&'static str);

    impl Transport for CannedTransport {
        fn exchange(&self, _host: &str, _request: &protocol::Node) -> Result<protocol::Node, TransportError> {
            Ok(protocol::from_xml(self.0)?)
        }
    }

    fn canned_service(response: &'static str) -> DeviceService {
        let registry = Registry::new(vec![device("d1", 5), device("d2", 6)], vec![]).into_shared();
        DeviceService::new(Box::new(CannedTransport(response)), registry, MatchRule::All)
    }

    fn state_of(service: &DeviceService, id: &str) -> Device {
        registry::lock(service.registry())
            .device(&DeviceId(id.into()))
            .cloned()
            .expect("device present")
    }

    #[test]
    fn poll_records_state_model_and_group() {
        let (service, sim) = service_with(vec![device("d1", 5)], vec![]);
        sim.add_unit(HOST, 5, 3, "PKFY-P", heat_20());

        let summary = service.poll_all();
        assert_eq!(summary.working, 1);

        let d = state_of(&service, "d1");
        assert_eq!(d.state.settings, Some(heat_20()));
        assert_eq!(d.model.as_deref(), Some("PKFY-P"));
        assert_eq!(d.resolution(), AddressResolution::Resolved(3));
        assert!(d.state.updated_at.is_some());
    }

    #[test]
    fn devices_on_one_host_share_a_request() {
        let (service, sim) = service_with(vec![device("d1", 5), device("d2", 6)], vec![]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());
        sim.add_unit(HOST, 6, 2, "B", cool_22());

        service.poll_all();
        let calls = sim.exchanges();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, GET_REQUEST);
        assert_eq!(calls[0].addresses, vec![5, 6]);
    }

    #[test]
    fn missing_item_fails_only_that_device() {
        let (service, sim) = service_with(vec![device("d1", 5), device("d2", 6)], vec![]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());

        let summary = service.poll_all();
        assert_eq!((summary.working, summary.failed), (1, 1));
        assert!(state_of(&service, "d1").is_working());
        assert_eq!(state_of(&service, "d2").state.fails, 1);
    }

    #[test]
    fn bad_item_fails_only_its_device() {
        let service = canned_service(
            r#"<Packet><Command>getResponse</Command><DatabaseManager>
            <Mnet Ec="1" Address="5" Group="1" Model="A" Drive="ON" Mode="COOL" SetTemp="22.0" FanSpeed="AUTO" AirDirection="SWING"/>
            <Mnet Ec="1" Address="6" Group="1" Model="A" Drive="ON" Mode="TURBO" SetTemp="22.0" FanSpeed="AUTO" AirDirection="SWING"/>
            </DatabaseManager></Packet>"#,
        );

        let summary = service.poll_all();
        assert_eq!((summary.working, summary.failed), (1, 1));
        let d1 = state_of(&service, "d1");
        assert_eq!(d1.state.fails, 0);
        assert_eq!(d1.state.settings, Some(cool_22()));
        assert_eq!(d1.resolution(), AddressResolution::Resolved(1));
        let d2 = state_of(&service, "d2");
        assert_eq!(d2.state.fails, 1);
        assert_eq!(d2.state.settings, None);
    }

    #[test]
    fn error_response_fails_the_whole_batch() {
        let service = canned_service(
            r#"<Packet><Command>getErrorResponse</Command><DatabaseManager>
            <ERROR Point="Address" Code="0101" Message="Invalid Value"/>
            </DatabaseManager></Packet>"#,
        );

        let summary = service.poll_all();
        assert_eq!((summary.working, summary.failed), (0, 2));
        assert_eq!(state_of(&service, "d1").state.fails, 1);
        assert_eq!(state_of(&service, "d2").state.fails, 1);
    }

    #[test]
    fn poll_device_polls_one_device_without_matching() {
        let (service, sim) = service_with(vec![device("d1", 5), device("d2", 6)], vec![]);
        let listener = RecordingListener::default();
        let service = service.with_listener(Box::new(listener.clone()));
        sim.add_unit(HOST, 5, 1, "A", heat_20());
        sim.add_unit(HOST, 6, 1, "A", heat_20());

        let summary = service.poll_device(&DeviceId("d2".into())).expect("known device");
        assert_eq!(summary.working, 1);
        assert_eq!(sim.exchanges()[0].addresses, vec![6]);
        assert_eq!(state_of(&service, "d2").state.settings, Some(heat_20()));
        assert_eq!(state_of(&service, "d1").state.settings, None);
        assert_eq!(listener.refreshes(), 0);

        let err = service.poll_device(&DeviceId("nope".into())).unwrap_err();
        assert!(matches!(err, MnetError::UnknownDevice(_)), "{err}");
    }

    #[test]
    fn invalid_device_fails_without_network_call() {
        let mut broken = device("d2", 6);
        broken.ec = None;
        let (service, sim) = service_with(vec![broken], vec![]);

        let summary = service.poll_all();
        assert_eq!(summary.failed, 1);
        assert!(sim.exchanges().is_empty());
        assert_eq!(state_of(&service, "d2").state.fails, 1);
    }

    #[test]
    fn unreachable_host_fails_every_device_on_it() {
        let mut other = device("d3", 1);
        other.set_host("10.0.0.9");
        let (service, sim) = service_with(vec![device("d1", 5), device("d2", 6), other], vec![]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());
        sim.add_unit(HOST, 6, 1, "A", heat_20());
        sim.add_unit("10.0.0.9", 1, 1, "A", heat_20());
        sim.set_unreachable(HOST, true);

        let summary = service.poll_all();
        assert_eq!((summary.working, summary.failed), (1, 2));
        assert!(!state_of(&service, "d1").is_working());
        assert!(state_of(&service, "d3").is_working());
    }

    #[test]
    fn poll_covers_unselected_devices() {
        let mut d = device("d1", 5);
        d.selected = false;
        let (service, sim) = service_with(vec![d], vec![]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());
        assert_eq!(service.poll_all().working, 1);
    }

    #[test]
    fn adjust_disabled_device_sends_nothing() {
        let mut d = device("d1", 5);
        d.enabled = false;
        let (service, sim) = service_with(vec![d], vec![]);
        let before = state_of(&service, "d1").state;

        let preset = Preset::new("p", "Cool", cool_22());
        let outcome = service.adjust(&DeviceId("d1".into()), &preset).expect("skipped");
        assert_eq!(outcome, AdjustOutcome::Skipped);
        assert!(sim.exchanges().is_empty());
        assert_eq!(state_of(&service, "d1").state, before);
    }

    #[test]
    fn adjust_applies_echoed_state_and_matches() {
        let preset = Preset::new("p", "Cool", cool_22());
        let (service, sim) = service_with(vec![device("d1", 5)], vec![preset.clone()]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());

        let outcome = service.adjust(&DeviceId("d1".into()), &preset).expect("applied");
        assert_eq!(outcome, AdjustOutcome::Applied);
        assert_eq!(state_of(&service, "d1").state.settings, Some(cool_22()));
        assert_eq!(sim.unit_settings(HOST, 5), Some(cool_22()));
        let registry = registry::lock(service.registry());
        assert!(registry.preset(&PresetId("p".into())).expect("preset").active);
    }

    #[test]
    fn adjust_without_echo_polls_again() {
        let preset = Preset::new("p", "Cool", cool_22());
        let (service, sim) = service_with(vec![device("d1", 5)], vec![]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());
        sim.set_echo_state(false);

        service.adjust(&DeviceId("d1".into()), &preset).expect("applied");
        let commands: Vec<String> = sim.exchanges().into_iter().map(|e| e.command).collect();
        assert_eq!(commands, vec![SET_REQUEST.to_string(), GET_REQUEST.to_string()]);
        assert_eq!(state_of(&service, "d1").state.settings, Some(cool_22()));
    }

    #[test]
    fn adjust_failure_counts_and_still_matches() {
        let preset = Preset::new("p", "Heat", heat_20());
        let (service, sim) = service_with(vec![device("d1", 5), device("d2", 6)], vec![preset.clone()]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());
        sim.add_unit(HOST, 6, 1, "A", heat_20());
        service.update();
        assert!(registry::lock(service.registry()).presets[0].active);

        let listener = RecordingListener::default();
        let service = service.with_listener(Box::new(listener.clone()));
        sim.set_unreachable(HOST, true);
        let err = service.adjust(&DeviceId("d2".into()), &preset).unwrap_err();
        assert!(matches!(err, MnetError::Transport(_)), "{err}");
        assert_eq!(state_of(&service, "d2").state.fails, 1);
        // d2 dropped out of the eligible set; d1 still matches
        assert_eq!(listener.refreshes(), 1);
        assert!(registry::lock(service.registry()).presets[0].active);
    }

    #[test]
    fn adjust_all_skips_unselected_and_disabled() {
        let mut unselected = device("d2", 6);
        unselected.selected = false;
        let mut disabled = device("d3", 7);
        disabled.enabled = false;
        let preset = Preset::new("p", "Cool", cool_22());
        let (service, sim) = service_with(vec![device("d1", 5), unselected, disabled], vec![]);
        for address in [5, 6, 7] {
            sim.add_unit(HOST, address, 1, "A", heat_20());
        }

        let summary = service.adjust_all(&preset);
        assert_eq!(summary, AdjustSummary { applied: 1, failed: 0 });
        assert_eq!(sim.unit_settings(HOST, 5), Some(cool_22()));
        assert_eq!(sim.unit_settings(HOST, 6), Some(heat_20()));
        assert_eq!(sim.unit_settings(HOST, 7), Some(heat_20()));
    }

    #[test]
    fn reconfigured_device_discards_outcome() {
        let (service, sim) = service_with(vec![device("d1", 5)], vec![]);
        sim.add_unit(HOST, 5, 1, "A", heat_20());
        let snapshot = registry::lock(service.registry()).devices.clone();

        registry::lock(service.registry()).devices[0].set_address(Some(9));
        let summary = service.poll(&snapshot);
        assert_eq!(summary.discarded, 1);
        let d = state_of(&service, "d1");
        assert_eq!(d.state.settings, None);
        assert_eq!(d.resolution(), AddressResolution::NeedsRediscovery);
    }

    #[test]
    fn three_failures_then_recovery_activates_preset() {
        let preset = Preset::new("p", "Cool", cool_22());
        let mut d1 = device("d1", 5);
        d1.ec = Some(Ec(1));
        let (service, sim) = service_with(vec![d1], vec![preset]);
        sim.add_unit(HOST, 5, 1, "A", cool_22());
        sim.set_unreachable(HOST, true);

        for _ in 0..3 {
            service.update();
        }
        let d = state_of(&service, "d1");
        assert_eq!(d.state.fails, 3);
        assert!(!d.is_working());
        assert!(!registry::lock(service.registry()).presets[0].active);

        sim.set_unreachable(HOST, false);
        service.update();
        let d = state_of(&service, "d1");
        assert!(d.is_working());
        assert_eq!(d.state.settings, Some(cool_22()));
        assert!(registry::lock(service.registry()).presets[0].active);
    }
}
