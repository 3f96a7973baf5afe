//! In-process stand-in for M-NET centralized controllers.
//!
//! Answers `getRequest`/`setRequest` documents for a table of simulated units,
//! round-tripping every document through the XML codec. Failures can be
//! injected per host or at random with a seeded RNG.

use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::client::{Transport, TransportError};
use crate::models::mnet::{AirDirection, Drive, Ec, FanSpeed, Mode, Settings, Temperature};
use crate::protocol::{self, GET_REQUEST, GET_RESPONSE, Item, Node, SET_REQUEST, SET_RESPONSE};
use crate::registry::Registry;

const MODES: [Mode; 4] = [Mode::Cool, Mode::Heat, Mode::Dry, Mode::Fan];
const FAN_SPEEDS: [FanSpeed; 5] = [FanSpeed::Low, FanSpeed::Mid1, FanSpeed::Mid2, FanSpeed::High, FanSpeed::Auto];
const AIR_DIRECTIONS: [AirDirection; 3] = [AirDirection::Swing, AirDirection::Horizontal, AirDirection::Auto];
/// Only the most recent exchanges are kept.
const EXCHANGE_LOG_LEN: usize = 256;

#[derive(Debug, Clone)]
struct Unit {
    ec: Ec,
    group: u32,
    model: String,
    settings: Settings,
    inlet: Temperature,
}

/// One request seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub host: String,
    pub command: String,
    pub addresses: Vec<u32>,
}

struct Inner {
    units: BTreeMap<(String, u32), Unit>,
    unreachable: HashSet<String>,
    failure_rate: f64,
    echo_state: bool,
    rng: SmallRng,
    exchanges: VecDeque<Exchange>,
}

/// Cloning yields another handle to the same simulated installation.
#[derive(Clone)]
pub struct SimulatedController {
    inner: Arc<Mutex<Inner>>,
}

impl SimulatedController {
    pub fn new(seed: u64) -> Self {
        SimulatedController {
            inner: Arc::new(Mutex::new(Inner {
                units: BTreeMap::new(),
                unreachable: HashSet::new(),
                failure_rate: 0.0,
                echo_state: true,
                rng: SmallRng::seed_from_u64(seed),
                exchanges: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_unit(&self, host: &str, address: u32, group: u32, model: &str, settings: Settings) {
        self.lock().units.insert(
            (host.to_string(), address),
            Unit {
                ec: Ec(1),
                group,
                model: model.to_string(),
                settings,
                inlet: Temperature::from_tenths(210),
            },
        );
    }

    /// Adds a unit with random settings for every addressable device in `registry`.
    pub fn populate(&self, registry: &Registry) {
        let mut inner = self.lock();
        let mut added = 0;
        for device in &registry.devices {
            let (Some(ec), Some(address)) = (device.ec, device.address()) else {
                continue;
            };
            let key = (device.host().trim().to_string(), address);
            if inner.units.contains_key(&key) {
                continue;
            }
            let settings = random_settings(&mut inner.rng);
            let inlet = Temperature::from_tenths(inner.rng.random_range(170..=280));
            inner.units.insert(
                key,
                Unit {
                    ec,
                    group: address,
                    model: "SIM-PKFY".to_string(),
                    settings,
                    inlet,
                },
            );
            added += 1;
        }
        info!("Simulator: {} unit(s) added", added);
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut inner = self.lock();
        if unreachable {
            inner.unreachable.insert(host.to_string());
        } else {
            inner.unreachable.remove(host);
        }
    }

    /// Fraction of exchanges (0.0..=1.0) that fail with a simulated timeout.
    pub fn set_failure_rate(&self, rate: f64) {
        self.lock().failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Whether `setResponse` items carry the full resulting state.
    pub fn set_echo_state(&self, echo: bool) {
        self.lock().echo_state = echo;
    }

    pub fn unit_settings(&self, host: &str, address: u32) -> Option<Settings> {
        self.lock()
            .units
            .get(&(host.to_string(), address))
            .map(|u| u.settings.clone())
    }

    /// Recent requests, oldest first.
    pub fn exchanges(&self) -> Vec<Exchange> {
        self.lock().exchanges.iter().cloned().collect()
    }
}

fn random_settings(rng: &mut SmallRng) -> Settings {
    Settings {
        drive: if rng.random_bool(0.5) { Drive::On } else { Drive::Off },
        mode: MODES[rng.random_range(0..MODES.len())],
        // half degree steps between 18.0 and 26.0
        temperature: Temperature::from_tenths(rng.random_range(36..=52) * 5),
        fan: FAN_SPEEDS[rng.random_range(0..FAN_SPEEDS.len())],
        air: AIR_DIRECTIONS[rng.random_range(0..AIR_DIRECTIONS.len())],
    }
}

impl Inner {
    fn answer(&mut self, host: &str, command: &str, requested: &[Item]) -> Node {
        let mut replies = Vec::with_capacity(requested.len());
        for item in requested {
            let Some(unit) = self.units.get_mut(&(host.to_string(), item.address)) else {
                continue;
            };
            if command == SET_REQUEST {
                if item.group.is_some_and(|g| g != unit.group) {
                    return protocol::error_document(command, "Group", "0101", "Invalid Value");
                }
                if let Some(settings) = &item.settings {
                    unit.settings = settings.clone();
                }
            } else {
                let drift = self.rng.random_range(-2..=2);
                unit.inlet = Temperature::from_tenths(unit.inlet.tenths() + drift);
            }
            let full_state = command == GET_REQUEST || self.echo_state;
            replies.push(Item {
                ec: Some(unit.ec),
                address: item.address,
                group: Some(unit.group),
                model: Some(unit.model.clone()),
                settings: full_state.then(|| unit.settings.clone()),
                inlet_temperature: full_state.then_some(unit.inlet),
            });
        }
        let reply = if command == SET_REQUEST { SET_RESPONSE } else { GET_RESPONSE };
        protocol::document(reply, &replies)
    }
}

impl Transport for SimulatedController {
    fn exchange(&self, host: &str, request: &Node) -> Result<Node, TransportError> {
        let request = protocol::from_xml(&protocol::to_xml(request)?)?;
        let (command, items) =
            protocol::decode_document(&request).map_err(|e| TransportError::Malformed(e.to_string()))?;

        let mut inner = self.lock();
        if inner.exchanges.len() == EXCHANGE_LOG_LEN {
            inner.exchanges.pop_front();
        }
        inner.exchanges.push_back(Exchange {
            host: host.to_string(),
            command: command.clone(),
            addresses: items.iter().map(|i| i.address).collect(),
        });

        if inner.unreachable.contains(host) {
            return Err(TransportError::Transport(format!("{}: connection refused", host)));
        }
        let rate = inner.failure_rate;
        if rate > 0.0 && inner.rng.random_bool(rate) {
            debug!("Simulator: dropping {} to {}", command, host);
            return Err(TransportError::Transport(format!("{}: timed out", host)));
        }

        let response = match command.as_str() {
            GET_REQUEST | SET_REQUEST => inner.answer(host, &command, &items),
            other => protocol::error_document(other, "Command", "0001", "Unknown Command"),
        };
        Ok(protocol::from_xml(&protocol::to_xml(&response)?)?)
    }
}
