//! Deterministic multi-device runs over a simulated LAN.
//!
//! Devices share one virtual clock. Each step advances the clock, lets the
//! LAN re-announce published records when due, and pumps every engine once.

use std::collections::HashSet;
use std::time::Duration;

use beacon_core::hash::derive_peer_id;
use beacon_core::{MessageId, PeerId, SessionEpoch};
use beacon_node::config::millis;
use beacon_node::persistence::MemoryLedgerStore;
use beacon_node::runtime::{execute_commands, pump_once, RuntimeStats};
use beacon_node::{Engine, EngineConfig, EngineEvent, LocalIdentity, SendRejected};
use beacon_transport::lan::{LanConditions, LanSubstrate, SharedLan};
use beacon_transport::substrate::DiscoverySubstrate;
use serde::Serialize;

use crate::config::SimConfig;

/// Virtual wall clock at the start of every run.
pub const SIM_EPOCH_MS: u64 = 1_750_000_000_000;

pub struct SimDevice {
    pub name: String,
    pub peer_id: PeerId,
    pub engine: Engine,
    pub store: MemoryLedgerStore,
    /// Every event the engine produced, in order.
    pub events: Vec<EngineEvent>,
    pub stats: RuntimeStats,
    substrate: LanSubstrate,
    config: EngineConfig,
    epoch_secs: u64,
}

impl SimDevice {
    pub fn received(&self) -> impl Iterator<Item = &MessageId> {
        self.events.iter().filter_map(|e| match e {
            EngineEvent::MessageReceived { id, .. } => Some(id),
            _ => None,
        })
    }

    pub fn acked(&self) -> impl Iterator<Item = &MessageId> {
        self.events.iter().filter_map(|e| match e {
            EngineEvent::AckReceived { id, .. } => Some(id),
            _ => None,
        })
    }

    pub fn sent(&self) -> impl Iterator<Item = &MessageId> {
        self.events.iter().filter_map(|e| match e {
            EngineEvent::MessageSent { id, .. } => Some(id),
            _ => None,
        })
    }
}

pub struct Simulation {
    lan: SharedLan,
    devices: Vec<SimDevice>,
    now_ms: u64,
    step_ms: u64,
    advertise_ms: u64,
    last_advertise: u64,
}

impl Simulation {
    pub fn new(conditions: LanConditions, step: Duration, advertise_interval: Duration) -> Self {
        Self {
            lan: SharedLan::new(conditions),
            devices: Vec::new(),
            now_ms: SIM_EPOCH_MS,
            step_ms: millis(step).max(1),
            advertise_ms: millis(advertise_interval),
            last_advertise: SIM_EPOCH_MS,
        }
    }

    /// Attaches a device whose peer id derives from `name`.
    pub fn add_device(&mut self, name: &str, config: EngineConfig) -> usize {
        let index = self.devices.len();
        let peer_id = derive_peer_id(name);
        let service_name = format!("{} {}", config.display_name, config.app_marker);
        let substrate = self.lan.join(format!("sim-{index:02}"), service_name);
        let epoch_secs = self.now_ms / 1000;
        let store = MemoryLedgerStore::default();
        let engine = Engine::new(
            LocalIdentity::new(peer_id.clone(), SessionEpoch::from_unix_secs(epoch_secs)),
            config.clone(),
            store.clone(),
        );
        self.devices.push(SimDevice {
            name: name.to_string(),
            peer_id,
            engine,
            store,
            events: Vec::new(),
            stats: RuntimeStats::default(),
            substrate,
            config,
            epoch_secs,
        });
        index
    }

    pub fn start(&mut self, index: usize) {
        let now = self.now_ms;
        if let Some(device) = self.devices.get_mut(index) {
            let capabilities = device.substrate.capabilities();
            device.engine.start(capabilities, now);
            flush(device, now);
        }
    }

    pub fn start_all(&mut self) {
        for index in 0..self.devices.len() {
            self.start(index);
        }
    }

    pub fn stop(&mut self, index: usize) {
        let now = self.now_ms;
        if let Some(device) = self.devices.get_mut(index) {
            device.engine.stop(now);
            flush(device, now);
        }
    }

    /// Stops a device and brings it back as a new process: same peer id and
    /// ledger, newer session epoch, empty live state.
    pub fn restart(&mut self, index: usize) {
        self.stop(index);
        let now = self.now_ms;
        let Some(device) = self.devices.get_mut(index) else {
            return;
        };
        device.epoch_secs = (now / 1000).max(device.epoch_secs + 1);
        device.engine = Engine::new(
            LocalIdentity::new(
                device.peer_id.clone(),
                SessionEpoch::from_unix_secs(device.epoch_secs),
            ),
            device.config.clone(),
            device.store.clone(),
        );
        tracing::info!(device = %device.name, epoch = device.epoch_secs, "device restarted");
        self.start(index);
    }

    /// Injects a substrate connection loss at one device.
    pub fn disconnect(&mut self, index: usize) {
        self.lan.disconnect(&format!("sim-{index:02}"));
    }

    pub fn set_conditions(&mut self, conditions: LanConditions) {
        self.lan.set_conditions(conditions);
    }

    pub fn send(
        &mut self,
        from: usize,
        text: &str,
        to: Option<usize>,
    ) -> Result<MessageId, SendRejected> {
        let target = to.and_then(|i| self.devices.get(i)).map(|d| d.peer_id.clone());
        let now = self.now_ms;
        let device = self
            .devices
            .get_mut(from)
            .ok_or(SendRejected::NotRunning)?;
        let result = device.engine.send_message(text, target, now);
        flush(device, now);
        result
    }

    pub fn step(&mut self) {
        self.now_ms += self.step_ms;
        if self.advertise_ms > 0 && self.now_ms - self.last_advertise >= self.advertise_ms {
            self.last_advertise = self.now_ms;
            self.lan.advertise_round();
        }
        let now = self.now_ms;
        for device in &mut self.devices {
            let events = pump_once(
                &mut device.engine,
                &mut device.substrate,
                now,
                &mut device.stats,
            );
            device.events.extend(events);
        }
    }

    pub fn run_for(&mut self, duration: Duration) {
        let until = self.now_ms.saturating_add(millis(duration));
        while self.now_ms < until {
            self.step();
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.now_ms - SIM_EPOCH_MS
    }

    pub fn device(&self, index: usize) -> Option<&SimDevice> {
        self.devices.get(index)
    }

    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    pub fn lan(&self) -> &SharedLan {
        &self.lan
    }

    pub fn report(&self) -> SimReport {
        let devices: Vec<DeviceReport> = self
            .devices
            .iter()
            .map(|d| DeviceReport::of(d, self.now_ms))
            .collect();
        SimReport {
            elapsed_ms: self.elapsed_ms(),
            sent: devices.iter().map(|d| d.sent).sum(),
            delivered: devices.iter().map(|d| d.received).sum(),
            duplicate_deliveries: devices.iter().map(|d| d.duplicate_deliveries).sum(),
            acked: devices.iter().map(|d| d.acked).sum(),
            pending: devices.iter().map(|d| d.pending).sum(),
            devices,
        }
    }
}

/// Hands engine requests made outside a step to the substrate right away.
fn flush(device: &mut SimDevice, now: u64) {
    execute_commands(&mut device.engine, &mut device.substrate, now, &mut device.stats);
    device.events.extend(device.engine.take_events());
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub name: String,
    pub peer_id: PeerId,
    pub sent: usize,
    pub received: usize,
    pub duplicate_deliveries: usize,
    pub acked: usize,
    pub syncs_completed: usize,
    pub pending: usize,
    pub pending_ack_count: usize,
    pub heartbeat_seq: u64,
    pub publishes: usize,
    pub withdraws: usize,
    pub substrate_events: usize,
}

impl DeviceReport {
    fn of(device: &SimDevice, now: u64) -> Self {
        let mut seen = HashSet::new();
        let mut duplicates = 0;
        for id in device.received() {
            if !seen.insert(id) {
                duplicates += 1;
            }
        }
        let acked: HashSet<&MessageId> = device.acked().collect();
        let syncs_completed = device
            .events
            .iter()
            .filter(|e| matches!(e, EngineEvent::SyncCompleted { .. }))
            .count();
        Self {
            name: device.name.clone(),
            peer_id: device.peer_id.clone(),
            sent: device.sent().count(),
            received: seen.len(),
            duplicate_deliveries: duplicates,
            acked: acked.len(),
            syncs_completed,
            pending: device.engine.snapshot(now).pending.len(),
            pending_ack_count: device.engine.pending_ack_count(),
            heartbeat_seq: device.engine.heartbeat_seq(),
            publishes: device.stats.publishes,
            withdraws: device.stats.withdraws,
            substrate_events: device.stats.substrate_events,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub elapsed_ms: u64,
    pub sent: usize,
    /// Distinct (receiver, message) deliveries.
    pub delivered: usize,
    pub duplicate_deliveries: usize,
    /// Distinct messages whose sender saw an acknowledgement.
    pub acked: usize,
    pub pending: usize,
    pub devices: Vec<DeviceReport>,
}

/// Builds a simulation from `config`, sends the scripted traffic, and runs
/// it to completion.
pub fn run_scenario(config: &SimConfig) -> SimReport {
    let mut sim = Simulation::new(
        LanConditions {
            loss: config.loss,
            duplicate: config.duplicate,
            seed: config.seed,
        },
        config.step,
        config.advertise_interval,
    );
    for index in 0..config.devices {
        let mut engine = config.engine.clone();
        engine.display_name = format!("{}-{index}", config.engine.display_name);
        sim.add_device(&format!("sim-device-{index}"), engine);
    }
    sim.start_all();
    sim.run_for(Duration::from_secs(3));

    let send_every = millis(config.send_interval).max(1);
    let mut next_send = sim.now_ms();
    let mut round = 0;
    let end = sim.now_ms().saturating_add(millis(config.duration));
    let mut rejected = 0_usize;
    while sim.now_ms() < end {
        if round < config.messages_per_device && sim.now_ms() >= next_send {
            for from in 0..config.devices {
                let to = (!config.broadcast).then_some((from + 1) % config.devices);
                let text = format!("message {round} from device {from}");
                if let Err(err) = sim.send(from, &text, to) {
                    rejected += 1;
                    tracing::debug!(from, %err, "scripted send rejected");
                }
            }
            round += 1;
            next_send += send_every;
        }
        sim.step();
    }
    if rejected > 0 {
        tracing::warn!(rejected, "some scripted sends were rejected");
    }
    sim.report()
}
