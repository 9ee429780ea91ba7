//! # lpwansim-runner
//!
//! Tick-synchronous scheduler and scenario tooling for the LPWAN
//! simulator.
//!
//! This crate provides:
//! - The [`Scheduler`] driving devices and the shared medium tick by tick
//! - Topology loading and generation ([`Topology`])
//! - Scenario assembly ([`build_simulation`])
//! - ALOHA throughput bookkeeping ([`AlohaStats`])
//!
//! The simulation is single threaded and fully deterministic: devices are
//! stepped in their registration order, all randomness flows from seeded
//! generators, and a run with the same inputs produces the same report.

use clap::ValueEnum;
use lpwansim_medium::{Medium, MediumError};
use lpwansim_phy::Location;
use lpwansim_proto::{
    ClassANode, ClassANodeConfig, Device, Gateway, GatewayConfig, GatewayMode, RelayNode,
    RelayNodeConfig, TrafficModel,
};
use lpwansim_radio::{
    ConfigError, DeviceId, Interrupt, PacketId, RadioParams, Tick, WakeUpRadioParams,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while assembling or running a simulation.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// IO error reading a scenario file or writing a report.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON in a scenario file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid radio configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A device put an impossible signal into the medium.
    #[error("medium error: {0}")]
    Medium(#[from] MediumError),

    /// The scenario description is inconsistent.
    #[error("scenario error: {0}")]
    Scenario(String),
}

// ============================================================================
// Scheduler
// ============================================================================

/// Summary of one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Ticks simulated.
    pub ticks: Tick,
    /// Devices in the simulation.
    pub device_count: u64,
    /// Devices that completed their join procedure.
    pub joined_devices: u64,
    /// Application data packets generated across all devices.
    pub generated_packets: u64,
    /// Unique application data packets that reached a sink.
    pub unique_received_packets: u64,
    /// Received over generated, zero when nothing was generated.
    pub delivery_ratio: f64,
}

/// The tick-synchronous simulation loop.
///
/// Each tick runs in two phases over the registered devices: first every
/// device with a pending transmission executes and its signals enter the
/// medium, then every remaining device executes and samples the medium.
/// All interrupts are folded through the drivers afterwards and the medium
/// advances. Within a phase, devices run in registration order.
pub struct Scheduler {
    medium: Medium,
    devices: Vec<Box<dyn Device>>,
    now: Tick,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty simulation.
    pub fn new() -> Self {
        Scheduler { medium: Medium::new(), devices: Vec::new(), now: 0 }
    }

    /// Register a device. Registration order fixes the stepping order.
    pub fn add_device(&mut self, device: Box<dyn Device>) {
        debug!(device = %device.id(), "device registered");
        self.devices.push(device);
    }

    /// Current simulation time.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Advance the simulation by one tick.
    pub fn step(&mut self) -> Result<(), RunnerError> {
        let now = self.now;
        let count = self.devices.len();
        let mut interrupts: Vec<Option<Interrupt>> = vec![None; count];
        let mut transmitted = vec![false; count];

        for i in 0..count {
            if self.devices[i].wants_transmit() {
                transmitted[i] = true;
                let out = self.devices[i].execute(now, &self.medium);
                if let Some(signal) = out.signal {
                    self.medium.insert(signal)?;
                }
                if let Some(beacon) = out.beacon {
                    self.medium.insert_beacon(beacon);
                }
                interrupts[i] = out.interrupt;
            }
        }
        for i in 0..count {
            if !transmitted[i] {
                interrupts[i] = self.devices[i].execute(now, &self.medium).interrupt;
            }
        }
        for i in 0..count {
            self.devices[i].drive(interrupts[i], now);
        }

        self.medium.tick();
        self.now += 1;
        Ok(())
    }

    /// Run for `ticks` ticks and summarize.
    pub fn run(&mut self, ticks: u64) -> Result<RunReport, RunnerError> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(self.report())
    }

    /// Summary of the simulation so far.
    pub fn report(&self) -> RunReport {
        let mut generated = 0u64;
        let mut joined = 0u64;
        let mut received: HashSet<&PacketId> = HashSet::new();
        for device in &self.devices {
            generated += device.generated_data();
            if device.joined() {
                joined += 1;
            }
            if let Some(ids) = device.received_data() {
                received.extend(ids);
            }
        }
        let unique = received.len() as u64;
        RunReport {
            ticks: self.now,
            device_count: self.devices.len() as u64,
            joined_devices: joined,
            generated_packets: generated,
            unique_received_packets: unique,
            delivery_ratio: if generated > 0 { unique as f64 / generated as f64 } else { 0.0 },
        }
    }

    /// Whether every registered device has joined.
    pub fn all_joined(&self) -> bool {
        self.devices.iter().all(|d| d.joined())
    }
}

// ============================================================================
// Topology
// ============================================================================

/// One device placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyEntry {
    /// Device identity.
    #[serde(rename = "ID")]
    pub id: String,
    /// Device position in meters.
    #[serde(rename = "Location")]
    pub location: Location,
    /// Per-device spreading factor overriding the parameter file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sf: Option<u8>,
    /// Per-device channel overriding the parameter file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_channel: Option<u8>,
}

impl TopologyEntry {
    /// Radio parameters for this device: the shared parameter file with any
    /// per-device tuning overrides applied.
    fn params(&self, base: &RadioParams) -> RadioParams {
        let mut params = base.clone();
        if let Some(sf) = self.default_sf {
            params.sf = sf;
        }
        if let Some(channel) = self.default_channel {
            params.channel = channel;
        }
        params
    }
}

/// Device placements for a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// End devices.
    #[serde(rename = "Nodes")]
    pub nodes: Vec<TopologyEntry>,
    /// Gateways.
    #[serde(rename = "Gateways")]
    pub gateways: Vec<TopologyEntry>,
    /// Multihop relays.
    #[serde(rename = "Relays", default)]
    pub relays: Vec<TopologyEntry>,
}

impl Topology {
    /// Load a topology from a JSON file.
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path)?;
        let topology: Topology = serde_json::from_str(&text)?;
        if topology.gateways.is_empty() {
            return Err(RunnerError::Scenario("topology has no gateway".to_string()));
        }
        Ok(topology)
    }

    /// Generate `n_nodes` nodes uniformly over a disc of `radius_m` meters
    /// around a single gateway at the origin.
    pub fn random(n_nodes: usize, radius_m: f64, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let nodes = (0..n_nodes)
            .map(|i| {
                let angle = rng.gen_range(0.0..std::f64::consts::TAU);
                // sqrt for an area-uniform draw; keep clear of the
                // reference distance of the path loss model.
                let r = 1.0 + (radius_m - 1.0).max(0.0) * rng.gen::<f64>().sqrt();
                TopologyEntry {
                    id: format!("node-{}", i),
                    location: Location::new(r * angle.cos(), r * angle.sin()),
                    default_sf: None,
                    default_channel: None,
                }
            })
            .collect();
        Topology {
            nodes,
            gateways: vec![TopologyEntry {
                id: "gateway-0".to_string(),
                location: Location::new(0.0, 0.0),
                default_sf: None,
                default_channel: None,
            }],
            relays: Vec::new(),
        }
    }
}

// ============================================================================
// Scenario Assembly
// ============================================================================

/// Which protocol family the scenario runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    /// LoRaWAN-style Class A with a star topology.
    ClassA,
    /// Clustered multihop with relays and wake-up radios.
    Multihop,
}

/// Everything beyond placements needed to assemble a run.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Protocol family.
    pub protocol: Protocol,
    /// Per-tick Bernoulli generation probability for every traffic source.
    pub gen_probability: f64,
    /// Run seed; combined with device identities for per-device streams.
    pub seed: u64,
    /// Cluster channel assigned by multihop gateways.
    pub cluster_channel: u8,
    /// Node configuration applied to every end device.
    pub node_config: ClassANodeConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            protocol: Protocol::ClassA,
            gen_probability: 0.001,
            seed: 1,
            cluster_channel: 4,
            node_config: ClassANodeConfig::default(),
        }
    }
}

/// Assemble a scheduler from placements and parameters.
///
/// Devices are registered gateways first, then relays, then nodes, each in
/// file order, which fixes the deterministic stepping order.
pub fn build_simulation(
    topology: &Topology,
    radio_params: &RadioParams,
    wakeup_params: Option<&WakeUpRadioParams>,
    scenario: &ScenarioConfig,
) -> Result<Scheduler, RunnerError> {
    if !(0.0..=1.0).contains(&scenario.gen_probability) {
        return Err(RunnerError::Scenario(format!(
            "generation probability {} outside [0, 1]",
            scenario.gen_probability
        )));
    }
    if !topology.relays.is_empty() && wakeup_params.is_none() {
        return Err(RunnerError::Scenario(
            "topology has relays but no wake-up radio parameters".to_string(),
        ));
    }

    let mode = match scenario.protocol {
        Protocol::ClassA => GatewayMode::ClassA,
        Protocol::Multihop => GatewayMode::Multihop { cluster_channel: scenario.cluster_channel },
    };

    let mut scheduler = Scheduler::new();
    for entry in &topology.gateways {
        let gateway = Gateway::new(
            DeviceId::new(&entry.id),
            entry.params(radio_params),
            entry.location,
            GatewayConfig { mode, ..GatewayConfig::default() },
        )?;
        scheduler.add_device(Box::new(gateway));
    }
    for entry in &topology.relays {
        let id = DeviceId::new(&entry.id);
        let traffic = TrafficModel::new(&id, scenario.gen_probability, scenario.seed);
        let wurx = wakeup_params
            .cloned()
            .ok_or_else(|| RunnerError::Scenario("missing wake-up radio parameters".to_string()))?;
        let relay = RelayNode::new(
            id,
            entry.params(radio_params),
            wurx,
            entry.location,
            RelayNodeConfig::default(),
            traffic,
        )?;
        scheduler.add_device(Box::new(relay));
    }
    for entry in &topology.nodes {
        let id = DeviceId::new(&entry.id);
        let traffic = TrafficModel::new(&id, scenario.gen_probability, scenario.seed);
        let mut node = ClassANode::new(
            id,
            entry.params(radio_params),
            entry.location,
            scenario.node_config.clone(),
            traffic,
        )?;
        if scenario.protocol == Protocol::Multihop {
            if let Some(wurx) = wakeup_params {
                node = node.with_wake_up_radio(wurx.clone());
            }
        }
        scheduler.add_device(Box::new(node));
    }

    info!(
        gateways = topology.gateways.len(),
        relays = topology.relays.len(),
        nodes = topology.nodes.len(),
        "simulation assembled"
    );
    Ok(scheduler)
}

// ============================================================================
// ALOHA Statistics
// ============================================================================

/// One point on the ALOHA load/throughput curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlohaRun {
    /// Per-tick generation probability used for the run.
    pub gen_probability: f64,
    /// Traffic sources in the run.
    pub n_nodes: u64,
    /// Ticks simulated.
    pub duration_ticks: u64,
    /// Normalization slot width in ticks (one packet airtime).
    pub slot_ticks: u64,
    /// Packets generated.
    pub generated: u64,
    /// Unique packets received.
    pub received: u64,
    /// Offered load G in packets per slot.
    pub offered_load: f64,
    /// Throughput S in packets per slot.
    pub throughput: f64,
}

/// Accumulates load/throughput points across a probability sweep. The
/// classic slotted-ALOHA curve peaks at S = 1/e near G = 1, which is what
/// a probability sweep of Class A nodes without windows reproduces.
#[derive(Debug, Default, Serialize)]
pub struct AlohaStats {
    /// All recorded points, in insertion order.
    pub runs: Vec<AlohaRun>,
}

impl AlohaStats {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        AlohaStats::default()
    }

    /// Record one run. `slot_ticks` normalizes tick counts into slot
    /// units, so G and S are comparable with the analytic curve.
    pub fn add_run(
        &mut self,
        gen_probability: f64,
        n_nodes: u64,
        duration_ticks: u64,
        slot_ticks: u64,
        generated: u64,
        received: u64,
    ) {
        let slots = duration_ticks as f64 / slot_ticks.max(1) as f64;
        let offered_load = if slots > 0.0 { generated as f64 / slots } else { 0.0 };
        let throughput = if slots > 0.0 { received as f64 / slots } else { 0.0 };
        self.runs.push(AlohaRun {
            gen_probability,
            n_nodes,
            duration_ticks,
            slot_ticks,
            generated,
            received,
            offered_load,
            throughput,
        });
    }

    /// Write the accumulated points as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<(), RunnerError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aloha_normalization() {
        let mut stats = AlohaStats::new();
        stats.add_run(0.001, 10, 10_000, 100, 100, 80);
        let run = &stats.runs[0];
        assert!((run.offered_load - 1.0).abs() < 1e-12);
        assert!((run.throughput - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_random_topology_deterministic() {
        let a = Topology::random(16, 500.0, 7);
        let b = Topology::random(16, 500.0, 7);
        assert_eq!(a.nodes.len(), 16);
        assert_eq!(a.gateways.len(), 1);
        for (na, nb) in a.nodes.iter().zip(&b.nodes) {
            assert_eq!(na.id, nb.id);
            assert_eq!(na.location, nb.location);
        }
    }

    #[test]
    fn test_random_topology_respects_radius() {
        let t = Topology::random(64, 200.0, 3);
        for node in &t.nodes {
            let d = (node.location.x.powi(2) + node.location.y.powi(2)).sqrt();
            assert!((1.0..=200.0 + 1e-9).contains(&d), "node at {} m", d);
        }
    }

    #[test]
    fn test_build_rejects_bad_probability() {
        let topology = Topology::random(1, 10.0, 1);
        let params = test_radio_params();
        let scenario = ScenarioConfig { gen_probability: 1.5, ..ScenarioConfig::default() };
        assert!(matches!(
            build_simulation(&topology, &params, None, &scenario),
            Err(RunnerError::Scenario(_))
        ));
    }

    #[test]
    fn test_build_rejects_relays_without_wakeup_params() {
        let mut topology = Topology::random(1, 10.0, 1);
        topology.relays.push(TopologyEntry {
            id: "r1".to_string(),
            location: Location::new(5.0, 0.0),
            default_sf: None,
            default_channel: None,
        });
        let params = test_radio_params();
        let scenario = ScenarioConfig::default();
        assert!(matches!(
            build_simulation(&topology, &params, None, &scenario),
            Err(RunnerError::Scenario(_))
        ));
    }

    fn test_radio_params() -> RadioParams {
        RadioParams {
            sf: 7,
            channel: 1,
            bandwidth: 125,
            power_tx: 14.0,
            rssi_sf7: -123.0,
            rssi_sf8: -126.0,
            rssi_sf9: -129.0,
            rssi_sf10: -132.0,
            rssi_sf11: -134.5,
            rssi_sf12: -137.0,
        }
    }
}
