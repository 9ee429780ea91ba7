//! # lpwansim-proto
//!
//! Protocol drivers for the LPWAN simulator.
//!
//! This crate provides:
//! - The [`Device`] trait the scheduler steps every tick
//! - LoRaWAN-style Class A end devices with OTAA join ([`ClassANode`])
//! - Gateways with parallel demodulation paths ([`Gateway`])
//! - Multihop cluster relays with carrier sensing and wake-up radio
//!   support ([`RelayNode`])
//! - Bernoulli traffic generation ([`TrafficModel`])
//!
//! A driver is a state machine folded over radio interrupts: each tick the
//! device executes exactly one radio primitive for its current state and
//! the resulting [`Interrupt`] picks the next state. All state machines use
//! explicitly tagged states, so a device is never in an ambiguous phase.

use lpwansim_medium::Medium;
use lpwansim_phy as phy;
use lpwansim_phy::Location;
use lpwansim_radio::{
    ConfigError, Countdown, Destination, DeviceId, Interrupt, JoinAnswer, LoRaModule, Packet,
    PacketId, Payload, RadioParams, Tick, WakeUpRadioModule, WakeUpRadioParams, WakeUpSignal,
    WirelessSignal, MAX_SF, MIN_SF,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, trace};

// ============================================================================
// Device Trait
// ============================================================================

/// Everything a device put into the world during one tick.
#[derive(Debug, Default)]
pub struct StepOutput {
    /// Interrupt produced by the executed radio primitive.
    pub interrupt: Option<Interrupt>,
    /// LoRa fragment to insert into the medium.
    pub signal: Option<WirelessSignal>,
    /// Wake-up beacon to insert into the medium.
    pub beacon: Option<WakeUpSignal>,
}

impl StepOutput {
    /// No radio activity this tick.
    pub fn idle() -> Self {
        StepOutput::default()
    }

    /// An interrupt with nothing on the air.
    pub fn interrupt(interrupt: Option<Interrupt>) -> Self {
        StepOutput { interrupt, ..StepOutput::default() }
    }
}

/// A simulated device stepped by the scheduler.
///
/// Each tick the scheduler first calls [`execute`](Device::execute) on every
/// device that [`wants_transmit`](Device::wants_transmit), inserts their
/// signals into the medium, then calls `execute` on the remaining devices,
/// and finally folds each device's interrupt through
/// [`drive`](Device::drive). Transmissions therefore reach the medium
/// before any receiver samples it within the same tick.
pub trait Device {
    /// Device identity.
    fn id(&self) -> &DeviceId;

    /// Whether the pending action puts energy on the air this tick.
    fn wants_transmit(&self) -> bool;

    /// Execute the pending action for this tick.
    fn execute(&mut self, now: Tick, medium: &Medium) -> StepOutput;

    /// Fold the tick's interrupt into the protocol state machine.
    fn drive(&mut self, interrupt: Option<Interrupt>, now: Tick);

    /// Whether the device has completed its join procedure.
    fn joined(&self) -> bool {
        true
    }

    /// Number of application data packets generated so far.
    fn generated_data(&self) -> u64 {
        0
    }

    /// Unique application data packets received, for sink devices.
    fn received_data(&self) -> Option<&HashSet<PacketId>> {
        None
    }
}

// ============================================================================
// Traffic Model
// ============================================================================

/// Bernoulli traffic source: every idle tick a packet is generated with a
/// fixed probability. Each device gets its own stream seeded from the run
/// seed and the device identity, so runs are reproducible and devices are
/// decorrelated.
#[derive(Debug)]
pub struct TrafficModel {
    probability: f64,
    rng: ChaCha8Rng,
}

impl TrafficModel {
    /// Create a traffic source for one device.
    pub fn new(id: &DeviceId, probability: f64, seed: u64) -> Self {
        TrafficModel {
            probability,
            rng: ChaCha8Rng::seed_from_u64(seed ^ phy::identity_seed(id.as_str())),
        }
    }

    /// A source that never generates.
    pub fn silent(id: &DeviceId) -> Self {
        Self::new(id, 0.0, 0)
    }

    /// Sample one tick.
    pub fn fires(&mut self) -> bool {
        self.probability > 0.0 && self.rng.gen_bool(self.probability)
    }
}

// ============================================================================
// Receive Windows
// ============================================================================

/// One tick of an open receive window.
///
/// The radio samples its bucket and, on ticks where nothing new is heard,
/// steps a timeout sized to the preamble duration. Hearing a fragment
/// cancels the timeout, so an ongoing reception holds the window open; if
/// the transmission breaks off mid-packet the timeout re-arms and fires
/// with the partial buffer, which a decode attempt then rejects.
fn window_step(
    radio: &mut LoRaModule,
    now: Tick,
    medium: &Medium,
    timeout: u64,
    expected_segments: u64,
) -> Option<Interrupt> {
    let bucket = medium.bucket(radio.channel(), radio.sf()).unwrap_or(&[]);
    let before = radio.buffered_fragments();
    let interrupt = radio.receive_partial(now, bucket);
    if interrupt.is_some() || radio.buffered_fragments() > before {
        radio.cancel_timer();
        return interrupt;
    }

    match radio.sleep_delay(timeout) {
        Some(Interrupt::DelayEnd) => {
            if radio.has_buffered_fragments() {
                Some(radio.decode(now, expected_segments))
            } else {
                Some(Interrupt::RxTimeout)
            }
        }
        other => other,
    }
}

/// Preamble-sized window timeout in ticks for the radio's current tuning.
fn window_timeout(radio: &LoRaModule) -> u64 {
    phy::preamble_time(radio.sf(), radio.bandwidth_khz(), phy::DEFAULT_PREAMBLE_SYMBOLS).ceil()
        as u64
}

/// Expected fragment count of a join accept at the radio's current tuning.
fn accept_segments(radio: &LoRaModule) -> u64 {
    phy::airtime_ticks(
        lpwansim_radio::JOIN_ACCEPT_BYTES,
        radio.sf(),
        radio.bandwidth_khz(),
    )
    .max(1)
}

// ============================================================================
// Class A Node
// ============================================================================

/// Class A end device configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassANodeConfig {
    /// Whether the node performs OTAA join before sending data.
    pub join_enabled: bool,
    /// Whether data uplinks are followed by the two receive windows.
    pub receiving_windows_enabled: bool,
    /// Ticks between uplink end and the first receive window.
    pub rx1_delay: u64,
    /// Ticks between the first window closing and the second opening.
    pub rx2_delay: u64,
    /// Number of join contention slots.
    pub contention_slots: u64,
    /// Width of one contention slot in ticks.
    pub contention_slot_ticks: u64,
    /// Application message body for data uplinks.
    pub message: String,
}

impl Default for ClassANodeConfig {
    fn default() -> Self {
        ClassANodeConfig {
            join_enabled: true,
            receiving_windows_enabled: true,
            rx1_delay: 5000,
            rx2_delay: 1000,
            contention_slots: 64,
            contention_slot_ticks: 100,
            message: "sensor measurement 01".to_string(),
        }
    }
}

/// What a transmission or receive window belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Join,
    Data,
}

/// Which of the two Class A receive windows is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxSlot {
    Rx1,
    Rx2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassAState {
    /// Waiting out the join contention slot.
    JoinDelay { delay: u64 },
    /// Waiting out the wake-up beacon latency before the join request.
    JoinWake { remaining: u64 },
    /// Draining outbound fragments.
    Transmitting { exchange: Exchange },
    /// Waiting for a receive window to open.
    RxDelay { exchange: Exchange, slot: RxSlot },
    /// Receive window open.
    RxWindow { exchange: Exchange, slot: RxSlot },
    /// Nothing pending; traffic may generate.
    Idle,
}

/// A LoRaWAN-style Class A end device.
///
/// Unjoined nodes run the OTAA exchange: contention delay, join request,
/// then the Rx1/Rx2 windows for the accept. Join attempts retry without
/// bound, each with a fresh contention slot. Joined nodes generate data
/// uplinks from their traffic source.
pub struct ClassANode {
    radio: LoRaModule,
    wurx: Option<WakeUpRadioModule>,
    config: ClassANodeConfig,
    traffic: TrafficModel,
    state: ClassAState,
    joined: bool,
    hop_depth: u8,
    parent: Option<DeviceId>,
    attempts: u64,
    data_generated: u64,
}

impl ClassANode {
    /// Create a Class A node.
    pub fn new(
        id: DeviceId,
        params: RadioParams,
        location: Location,
        config: ClassANodeConfig,
        traffic: TrafficModel,
    ) -> Result<Self, ConfigError> {
        let radio = LoRaModule::new(id, params, location)?;
        let mut node = ClassANode {
            radio,
            wurx: None,
            config,
            traffic,
            state: ClassAState::Idle,
            joined: false,
            hop_depth: 0,
            parent: None,
            attempts: 0,
            data_generated: 0,
        };
        if node.config.join_enabled {
            node.state = ClassAState::JoinDelay { delay: node.contention_delay() };
        } else {
            node.joined = true;
        }
        Ok(node)
    }

    /// Attach a wake-up radio. The node then precedes each join request
    /// with a wake-up beacon, so sleeping relays are listening when the
    /// request goes out.
    pub fn with_wake_up_radio(mut self, params: WakeUpRadioParams) -> Self {
        let id = self.radio.id().clone();
        let location = self.radio.location();
        self.wurx = Some(WakeUpRadioModule::new(id, params, location));
        self
    }

    /// The node's radio, for inspection.
    pub fn radio(&self) -> &LoRaModule {
        &self.radio
    }

    /// Relay hops between this node and the gateway (0 when directly
    /// attached).
    pub fn hop_depth(&self) -> u8 {
        self.hop_depth
    }

    /// Identity of the cluster parent this node joined through, if any.
    pub fn parent(&self) -> Option<&DeviceId> {
        self.parent.as_ref()
    }

    /// Contention delay in ticks for the current attempt. The slot is
    /// derived from the identity and the attempt counter, so retries are
    /// reproducible but repeat collisions between two nodes resolve.
    fn contention_delay(&self) -> u64 {
        let key = format!("{}#{}", self.radio.id(), self.attempts);
        (phy::contention_slot(&key, self.config.contention_slots) + 1)
            * self.config.contention_slot_ticks
    }

    /// Drain the outbound queue and pick out a join accept addressed here,
    /// together with the identity of the device that sent it.
    fn take_join_accept(&mut self) -> Option<(JoinAnswer, DeviceId)> {
        let mut answer = None;
        while let Some(packet) = self.radio.pop_outbound() {
            if let Payload::JoinAccept(a) = &packet.payload {
                if packet.destination.matches(self.radio.id()) && answer.is_none() {
                    answer = Some((a.clone(), packet.source.clone()));
                }
            }
        }
        answer
    }

    fn complete_join(&mut self, answer: JoinAnswer, upstream: DeviceId) {
        match answer {
            JoinAnswer::ClassA { suggested_sf } => {
                let channel = self.radio.channel();
                if self.radio.retune(channel, suggested_sf).is_ok() {
                    info!(device = %self.radio.id(), sf = suggested_sf, "joined network");
                }
                self.hop_depth = 0;
                self.parent = None;
            }
            JoinAnswer::Multihop { cluster_channel, hop_depth } => {
                let sf = self.radio.sf();
                if self.radio.retune(cluster_channel, sf).is_ok() {
                    info!(
                        device = %self.radio.id(),
                        channel = cluster_channel,
                        hop_depth,
                        parent = %upstream,
                        "joined cluster"
                    );
                }
                self.hop_depth = hop_depth;
                self.parent = Some(upstream);
            }
        }
        self.joined = true;
        self.state = ClassAState::Idle;
    }

    fn window_failed(&mut self, exchange: Exchange, slot: RxSlot) {
        self.radio.clear_interrupted_fragments();
        self.state = match (exchange, slot) {
            (exchange, RxSlot::Rx1) => ClassAState::RxDelay { exchange, slot: RxSlot::Rx2 },
            (Exchange::Join, RxSlot::Rx2) => {
                self.attempts += 1;
                debug!(device = %self.radio.id(), attempt = self.attempts, "join retry");
                ClassAState::JoinDelay { delay: self.contention_delay() }
            }
            (Exchange::Data, RxSlot::Rx2) => ClassAState::Idle,
        };
    }

    /// Move from the contention delay into the request itself: either via
    /// the wake-up beacon hold-off or straight to transmission.
    fn start_join_request(&mut self, now: Tick) {
        match &mut self.wurx {
            Some(wurx) => {
                wurx.generate_beacon(now);
                // Beacon latency plus a tick of slack for the woken relay's
                // state transition.
                let hold_off = wurx.latency_ms() + 1;
                self.state = ClassAState::JoinWake { remaining: hold_off };
            }
            None => {
                self.radio.generate_packet(now, Payload::JoinRequest, Destination::Broadcast);
                self.state = ClassAState::Transmitting { exchange: Exchange::Join };
            }
        }
    }
}

impl Device for ClassANode {
    fn id(&self) -> &DeviceId {
        self.radio.id()
    }

    fn wants_transmit(&self) -> bool {
        matches!(self.state, ClassAState::Transmitting { .. })
            || matches!(self.state, ClassAState::JoinWake { .. })
                && self.wurx.as_ref().is_some_and(|w| w.has_pending_beacon())
    }

    fn execute(&mut self, now: Tick, medium: &Medium) -> StepOutput {
        match self.state {
            ClassAState::JoinDelay { delay } => {
                StepOutput::interrupt(self.radio.sleep_delay(delay))
            }
            ClassAState::JoinWake { remaining } => {
                let beacon = self.wurx.as_mut().and_then(|w| w.transmit_beacon());
                let interrupt = if remaining == 0 { Some(Interrupt::DelayEnd) } else { None };
                self.state = ClassAState::JoinWake { remaining: remaining.saturating_sub(1) };
                StepOutput { interrupt, signal: None, beacon }
            }
            ClassAState::Transmitting { .. } => {
                let (interrupt, signal) = self.radio.transmit_packet();
                StepOutput { interrupt, signal, beacon: None }
            }
            ClassAState::RxDelay { slot, .. } => {
                let delay = match slot {
                    RxSlot::Rx1 => self.config.rx1_delay,
                    RxSlot::Rx2 => self.config.rx2_delay,
                };
                StepOutput::interrupt(self.radio.sleep_delay(delay))
            }
            ClassAState::RxWindow { .. } => {
                let timeout = window_timeout(&self.radio);
                let expected = accept_segments(&self.radio);
                StepOutput::interrupt(window_step(&mut self.radio, now, medium, timeout, expected))
            }
            ClassAState::Idle => {
                if self.joined && self.traffic.fires() {
                    self.data_generated += 1;
                    let payload = Payload::Data { message: self.config.message.clone() };
                    StepOutput::interrupt(Some(self.radio.generate_packet(
                        now,
                        payload,
                        Destination::Broadcast,
                    )))
                } else {
                    StepOutput::idle()
                }
            }
        }
    }

    fn drive(&mut self, interrupt: Option<Interrupt>, now: Tick) {
        let Some(interrupt) = interrupt else { return };
        match (self.state, interrupt) {
            (ClassAState::JoinDelay { .. }, Interrupt::DelayEnd) => {
                self.start_join_request(now);
            }
            (ClassAState::JoinWake { .. }, Interrupt::DelayEnd) => {
                self.radio.generate_packet(now, Payload::JoinRequest, Destination::Broadcast);
                self.state = ClassAState::Transmitting { exchange: Exchange::Join };
            }
            (ClassAState::Idle, Interrupt::GeneratePacket) => {
                self.state = ClassAState::Transmitting { exchange: Exchange::Data };
            }
            (ClassAState::Transmitting { exchange }, Interrupt::TransmissionEnd) => {
                self.state = match exchange {
                    Exchange::Join => {
                        ClassAState::RxDelay { exchange: Exchange::Join, slot: RxSlot::Rx1 }
                    }
                    Exchange::Data if self.config.receiving_windows_enabled => {
                        ClassAState::RxDelay { exchange: Exchange::Data, slot: RxSlot::Rx1 }
                    }
                    Exchange::Data => ClassAState::Idle,
                };
            }
            (ClassAState::RxDelay { exchange, slot }, Interrupt::DelayEnd) => {
                self.state = ClassAState::RxWindow { exchange, slot };
            }
            (ClassAState::RxWindow { exchange, slot }, Interrupt::PacketDecoded) => {
                match exchange {
                    Exchange::Join => {
                        let outcome = match self.take_join_accept() {
                            Some((answer, upstream)) => {
                                self.complete_join(answer, upstream);
                                Interrupt::JoinAcceptSuccess
                            }
                            None => {
                                self.window_failed(exchange, slot);
                                Interrupt::JoinAcceptFailed
                            }
                        };
                        debug!(device = %self.radio.id(), ?outcome, tick = now, "join window closed");
                    }
                    Exchange::Data => {
                        // Only a downlink addressed to this device closes the
                        // window; overheard traffic does not acknowledge.
                        let mut acknowledged = false;
                        while let Some(packet) = self.radio.pop_outbound() {
                            if matches!(packet.destination, Destination::Device(_))
                                && packet.destination.matches(self.radio.id())
                            {
                                acknowledged = true;
                            }
                        }
                        if acknowledged {
                            self.state = ClassAState::Idle;
                        } else {
                            self.window_failed(exchange, slot);
                        }
                    }
                }
            }
            (
                ClassAState::RxWindow { exchange, slot },
                Interrupt::PacketNonDecoded | Interrupt::RxTimeout,
            ) => {
                self.window_failed(exchange, slot);
            }
            _ => {}
        }
    }

    fn joined(&self) -> bool {
        self.joined
    }

    fn generated_data(&self) -> u64 {
        self.data_generated
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Number of packets a gateway can demodulate in parallel.
pub const MAX_PARALLEL_DEMODULATORS: usize = 8;

/// How a gateway answers join requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// Suggest a spreading factor from the request's received power.
    ClassA,
    /// Assign cluster membership at hop depth 1.
    Multihop {
        /// Channel the gateway's cluster communicates on.
        cluster_channel: u8,
    },
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Ticks between decoding a join request and sending the accept.
    pub reply_delay: u64,
    /// Join answer mode.
    pub mode: GatewayMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig { reply_delay: 5000, mode: GatewayMode::ClassA }
    }
}

/// A join request awaiting its reply delay.
#[derive(Debug)]
struct PendingReply {
    source: DeviceId,
    channel: u8,
    sf: u8,
    received_power: f64,
    timer: Countdown,
}

/// A reply whose delay has elapsed, waiting for the transmitter.
#[derive(Debug)]
struct ReadyReply {
    source: DeviceId,
    channel: u8,
    sf: u8,
    received_power: f64,
}

/// A LoRaWAN-style gateway.
///
/// Each tick the gateway retunes up to [`MAX_PARALLEL_DEMODULATORS`]
/// demodulation paths onto the occupied medium slots and samples them all.
/// Ongoing receptions keep their path across ticks. Decoded join requests
/// are answered after the reply delay on the requester's tuning; decoded
/// data packets are recorded by identity, so duplicates count once.
pub struct Gateway {
    id: DeviceId,
    demodulators: Vec<LoRaModule>,
    tx_radio: LoRaModule,
    config: GatewayConfig,
    pending: Vec<PendingReply>,
    ready: VecDeque<ReadyReply>,
    received: HashSet<PacketId>,
}

impl Gateway {
    /// Create a gateway.
    pub fn new(
        id: DeviceId,
        params: RadioParams,
        location: Location,
        config: GatewayConfig,
    ) -> Result<Self, ConfigError> {
        let mut demodulators = Vec::with_capacity(MAX_PARALLEL_DEMODULATORS);
        for path in 0..MAX_PARALLEL_DEMODULATORS {
            demodulators.push(LoRaModule::new(
                DeviceId::new(format!("{}/demod{}", id, path)),
                params.clone(),
                location,
            )?);
        }
        let tx_radio = LoRaModule::new(id.clone(), params, location)?;
        Ok(Gateway {
            id,
            demodulators,
            tx_radio,
            config,
            pending: Vec::new(),
            ready: VecDeque::new(),
            received: HashSet::new(),
        })
    }

    /// Lowest spreading factor whose sensitivity a signal at `rx_power`
    /// dBm still clears. Falls back to SF12 for marginal links.
    pub fn suggest_sf(&self, rx_power: f64) -> u8 {
        (MIN_SF..=MAX_SF)
            .find(|&sf| rx_power >= self.tx_radio.sensitivity_at(sf))
            .unwrap_or(MAX_SF)
    }

    fn ingest(&mut self, packet: Packet) {
        match &packet.payload {
            Payload::JoinRequest => {
                trace!(gateway = %self.id, source = %packet.source, "join request received");
                self.pending.push(PendingReply {
                    source: packet.source.clone(),
                    channel: packet.channel,
                    sf: packet.sf,
                    received_power: packet.received_power.unwrap_or(f64::NEG_INFINITY),
                    timer: Countdown::default(),
                });
            }
            Payload::Data { .. } => {
                self.received.insert(packet.id);
            }
            Payload::JoinAccept(_) => {}
        }
    }

    /// Retune the demodulation paths onto the occupied slots and sample
    /// them, keeping ongoing receptions on their existing path.
    fn multiple_input(&mut self, now: Tick, medium: &Medium) -> Option<Interrupt> {
        let mut slots = medium.occupied();
        slots.truncate(MAX_PARALLEL_DEMODULATORS);
        let mut used = [false; MAX_PARALLEL_DEMODULATORS];
        let mut claimed = vec![false; slots.len()];

        for (d, demod) in self.demodulators.iter().enumerate() {
            let tuning = (demod.channel(), demod.sf());
            for (s, &slot) in slots.iter().enumerate() {
                if !claimed[s] && slot == tuning {
                    claimed[s] = true;
                    used[d] = true;
                    break;
                }
            }
        }
        for (s, &(channel, sf)) in slots.iter().enumerate() {
            if claimed[s] {
                continue;
            }
            if let Some(d) = used.iter().position(|&u| !u) {
                if self.demodulators[d].retune(channel, sf).is_ok() {
                    used[d] = true;
                    claimed[s] = true;
                }
            }
        }

        let mut interrupt = None;
        for (d, demod) in self.demodulators.iter_mut().enumerate() {
            if !used[d] {
                continue;
            }
            if let Ok(bucket) = medium.bucket(demod.channel(), demod.sf()) {
                if let Some(i) = demod.receive_partial(now, bucket) {
                    interrupt = Some(i);
                }
            }
        }

        let decoded: Vec<Packet> = self
            .demodulators
            .iter_mut()
            .flat_map(|demod| std::iter::from_fn(move || demod.pop_outbound()))
            .collect();
        for packet in decoded {
            self.ingest(packet);
        }
        interrupt
    }
}

impl Device for Gateway {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn wants_transmit(&self) -> bool {
        self.tx_radio.outbound_len() > 0
    }

    fn execute(&mut self, now: Tick, medium: &Medium) -> StepOutput {
        if self.tx_radio.outbound_len() > 0 {
            let (interrupt, signal) = self.tx_radio.transmit_packet();
            return StepOutput { interrupt, signal, beacon: None };
        }
        StepOutput::interrupt(self.multiple_input(now, medium))
    }

    fn drive(&mut self, _interrupt: Option<Interrupt>, now: Tick) {
        let delay = self.config.reply_delay;
        let mut matured = Vec::new();
        self.pending.retain_mut(|reply| {
            if reply.timer.step(delay) == Some(Interrupt::DelayEnd) {
                matured.push(ReadyReply {
                    source: reply.source.clone(),
                    channel: reply.channel,
                    sf: reply.sf,
                    received_power: reply.received_power,
                });
                false
            } else {
                true
            }
        });
        self.ready.extend(matured);

        if self.tx_radio.outbound_len() == 0 {
            if let Some(reply) = self.ready.pop_front() {
                if self.tx_radio.retune(reply.channel, reply.sf).is_ok() {
                    let answer = match self.config.mode {
                        GatewayMode::ClassA => JoinAnswer::ClassA {
                            suggested_sf: self.suggest_sf(reply.received_power),
                        },
                        GatewayMode::Multihop { cluster_channel } => {
                            JoinAnswer::Multihop { cluster_channel, hop_depth: 1 }
                        }
                    };
                    debug!(gateway = %self.id, to = %reply.source, ?answer, tick = now, "join accept queued");
                    self.tx_radio.generate_packet(
                        now,
                        Payload::JoinAccept(answer),
                        Destination::Device(reply.source),
                    );
                }
            }
        }
    }

    fn received_data(&self) -> Option<&HashSet<PacketId>> {
        Some(&self.received)
    }
}

// ============================================================================
// Multihop Relay
// ============================================================================

/// Carrier sensing window bounds in ticks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensingConfig {
    /// Minimum sensing window.
    pub min: u64,
    /// Maximum sensing window.
    pub max: u64,
}

impl Default for SensingConfig {
    fn default() -> Self {
        SensingConfig { min: 5, max: 15 }
    }
}

/// Multihop relay configuration.
#[derive(Debug, Clone)]
pub struct RelayNodeConfig {
    /// Ticks between uplink end and the first receive window.
    pub rx1_delay: u64,
    /// Ticks between the first window closing and the second opening.
    pub rx2_delay: u64,
    /// Number of join contention slots.
    pub contention_slots: u64,
    /// Width of one contention slot in ticks.
    pub contention_slot_ticks: u64,
    /// Ticks the relay stays listening for join requests before sleeping.
    pub listen_window: u64,
    /// Ticks between decoding a join request and sending the accept.
    pub reply_delay: u64,
    /// Carrier sensing window bounds.
    pub sensing: SensingConfig,
    /// Application message body for the relay's own uplinks.
    pub message: String,
}

impl Default for RelayNodeConfig {
    fn default() -> Self {
        RelayNodeConfig {
            rx1_delay: 5000,
            rx2_delay: 1000,
            contention_slots: 64,
            contention_slot_ticks: 100,
            listen_window: 60_000,
            reply_delay: 5000,
            sensing: SensingConfig::default(),
            message: "relay measurement 01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    /// Waiting out the join contention slot.
    JoinDelay { delay: u64 },
    /// Draining join request fragments.
    JoinTransmit,
    /// Waiting for a join receive window to open.
    JoinRxDelay { slot: RxSlot },
    /// Join receive window open.
    JoinRxWindow { slot: RxSlot },
    /// Awake on the cluster channel, serving joins and forwarding data.
    Listening { remaining: u64 },
    /// Wake-up radio only; the main radio is off.
    Sleeping,
    /// Carrier sensing before an uplink.
    Sensing { remaining: u64 },
    /// Draining outbound fragments.
    Transmitting { reply: bool },
}

/// A multihop cluster relay.
///
/// The relay joins its own upstream cluster first, then alternates between
/// a listening window, where it answers join requests from deeper nodes
/// and forwards their data, and a low-power sleep from which a wake-up
/// beacon recalls it. Uplinks are preceded by carrier sensing with a
/// randomized window.
pub struct RelayNode {
    radio: LoRaModule,
    wurx: WakeUpRadioModule,
    config: RelayNodeConfig,
    traffic: TrafficModel,
    state: RelayState,
    joined: bool,
    hop_depth: u8,
    parent: Option<DeviceId>,
    home: (u8, u8),
    attempts: u64,
    data_generated: u64,
    pending: Vec<PendingReply>,
    ready: VecDeque<ReadyReply>,
    forwarded: HashSet<PacketId>,
    rng: ChaCha8Rng,
}

impl RelayNode {
    /// Create a relay node.
    pub fn new(
        id: DeviceId,
        params: RadioParams,
        wurx_params: WakeUpRadioParams,
        location: Location,
        config: RelayNodeConfig,
        traffic: TrafficModel,
    ) -> Result<Self, ConfigError> {
        let radio = LoRaModule::new(id.clone(), params, location)?;
        let wurx = WakeUpRadioModule::new(id.clone(), wurx_params, location);
        let rng = ChaCha8Rng::seed_from_u64(phy::identity_seed(&format!("{}/sensing", id)));
        let home = (radio.channel(), radio.sf());
        let mut relay = RelayNode {
            radio,
            wurx,
            config,
            traffic,
            state: RelayState::Sleeping,
            joined: false,
            hop_depth: 0,
            parent: None,
            home,
            attempts: 0,
            data_generated: 0,
            pending: Vec::new(),
            ready: VecDeque::new(),
            forwarded: HashSet::new(),
            rng,
        };
        relay.state = RelayState::JoinDelay { delay: relay.contention_delay() };
        Ok(relay)
    }

    /// The relay's radio, for inspection.
    pub fn radio(&self) -> &LoRaModule {
        &self.radio
    }

    /// Relay hops between this relay and the gateway.
    pub fn hop_depth(&self) -> u8 {
        self.hop_depth
    }

    /// Identity of the cluster parent this relay joined through, if any.
    pub fn parent(&self) -> Option<&DeviceId> {
        self.parent.as_ref()
    }

    fn contention_delay(&self) -> u64 {
        let key = format!("{}#{}", self.radio.id(), self.attempts);
        (phy::contention_slot(&key, self.config.contention_slots) + 1)
            * self.config.contention_slot_ticks
    }

    fn sensing_window(&mut self) -> u64 {
        self.rng.gen_range(self.config.sensing.min..=self.config.sensing.max)
    }

    fn take_join_accept(&mut self) -> Option<(JoinAnswer, DeviceId)> {
        let mut answer = None;
        while let Some(packet) = self.radio.pop_outbound() {
            if let Payload::JoinAccept(a) = &packet.payload {
                if packet.destination.matches(self.radio.id()) && answer.is_none() {
                    answer = Some((a.clone(), packet.source.clone()));
                }
            }
        }
        answer
    }

    /// Harvest decoded packets while listening: join requests within wake
    /// range become pending replies, foreign data is staged for
    /// forwarding.
    fn harvest(&mut self) -> bool {
        let mut forward = Vec::new();
        while let Some(packet) = self.radio.pop_outbound() {
            match &packet.payload {
                Payload::JoinRequest => {
                    let rx_power = packet.received_power.unwrap_or(f64::NEG_INFINITY);
                    // Only nodes the wake-up link can later reach are
                    // adopted into the cluster.
                    if rx_power >= self.wurx.sensitivity() {
                        self.pending.push(PendingReply {
                            source: packet.source.clone(),
                            channel: packet.channel,
                            sf: packet.sf,
                            received_power: rx_power,
                            timer: Countdown::default(),
                        });
                    } else {
                        debug!(
                            relay = %self.radio.id(),
                            source = %packet.source,
                            rx_power,
                            "join request outside wake range"
                        );
                    }
                }
                Payload::Data { .. } => {
                    if packet.source != *self.radio.id() && !self.forwarded.contains(&packet.id) {
                        self.forwarded.insert(packet.id.clone());
                        forward.push(packet);
                    }
                }
                Payload::JoinAccept(_) => {}
            }
        }
        let staged = !forward.is_empty();
        for packet in forward {
            self.radio.forward_packet(packet);
        }
        staged
    }

    fn window_failed(&mut self, slot: RxSlot) {
        self.radio.clear_interrupted_fragments();
        self.state = match slot {
            RxSlot::Rx1 => RelayState::JoinRxDelay { slot: RxSlot::Rx2 },
            RxSlot::Rx2 => {
                self.attempts += 1;
                debug!(relay = %self.radio.id(), attempt = self.attempts, "join retry");
                RelayState::JoinDelay { delay: self.contention_delay() }
            }
        };
    }

    fn complete_join(&mut self, answer: JoinAnswer, upstream: DeviceId) {
        match answer {
            JoinAnswer::Multihop { cluster_channel, hop_depth } => {
                let sf = self.radio.sf();
                if self.radio.retune(cluster_channel, sf).is_ok() {
                    self.home = (cluster_channel, sf);
                }
                self.hop_depth = hop_depth;
                info!(
                    relay = %self.radio.id(),
                    channel = cluster_channel,
                    hop_depth,
                    parent = %upstream,
                    "joined cluster"
                );
                self.parent = Some(upstream);
            }
            JoinAnswer::ClassA { suggested_sf } => {
                let channel = self.radio.channel();
                if self.radio.retune(channel, suggested_sf).is_ok() {
                    self.home = (channel, suggested_sf);
                }
                self.hop_depth = 1;
                self.parent = None;
            }
        }
        self.joined = true;
        self.state = RelayState::Listening { remaining: self.config.listen_window };
    }

    /// Whether a matured reply can go out now, and stage it if so. Replies
    /// are only staged from the listening and sleeping states, so they
    /// never preempt an uplink in progress.
    fn stage_reply(&mut self, now: Tick) {
        if self.radio.outbound_len() > 0 {
            return;
        }
        let Some(reply) = self.ready.pop_front() else { return };
        if self.radio.retune(reply.channel, reply.sf).is_err() {
            return;
        }
        let answer = JoinAnswer::Multihop {
            cluster_channel: self.home.0,
            hop_depth: self.hop_depth + 1,
        };
        debug!(relay = %self.radio.id(), to = %reply.source, tick = now, "join accept queued");
        self.radio.generate_packet(now, Payload::JoinAccept(answer), Destination::Device(reply.source));
        self.wurx.generate_beacon(now);
        self.state = RelayState::Transmitting { reply: true };
    }
}

impl Device for RelayNode {
    fn id(&self) -> &DeviceId {
        self.radio.id()
    }

    fn wants_transmit(&self) -> bool {
        matches!(self.state, RelayState::JoinTransmit | RelayState::Transmitting { .. })
    }

    fn execute(&mut self, now: Tick, medium: &Medium) -> StepOutput {
        match self.state {
            RelayState::JoinDelay { delay } => {
                StepOutput::interrupt(self.radio.sleep_delay(delay))
            }
            RelayState::JoinTransmit => {
                let (interrupt, signal) = self.radio.transmit_packet();
                StepOutput { interrupt, signal, beacon: None }
            }
            RelayState::JoinRxDelay { slot } => {
                let delay = match slot {
                    RxSlot::Rx1 => self.config.rx1_delay,
                    RxSlot::Rx2 => self.config.rx2_delay,
                };
                StepOutput::interrupt(self.radio.sleep_delay(delay))
            }
            RelayState::JoinRxWindow { .. } => {
                let timeout = window_timeout(&self.radio);
                let expected = accept_segments(&self.radio);
                StepOutput::interrupt(window_step(&mut self.radio, now, medium, timeout, expected))
            }
            RelayState::Listening { remaining } => {
                let bucket = medium.bucket(self.radio.channel(), self.radio.sf()).unwrap_or(&[]);
                let interrupt = self.radio.receive_partial(now, bucket);
                if interrupt.is_none() && self.traffic.fires() {
                    self.data_generated += 1;
                    let payload = Payload::Data { message: self.config.message.clone() };
                    let i = self.radio.generate_packet(now, payload, Destination::Broadcast);
                    return StepOutput::interrupt(Some(i));
                }
                if interrupt.is_none() && remaining == 0 {
                    return StepOutput::interrupt(Some(Interrupt::DelayEnd));
                }
                self.state = RelayState::Listening { remaining: remaining.saturating_sub(1) };
                StepOutput::interrupt(interrupt)
            }
            RelayState::Sleeping => {
                self.wurx.listen(medium.beacons());
                if self.wurx.take_interrupt() {
                    return StepOutput::interrupt(Some(Interrupt::WakeUp));
                }
                if self.traffic.fires() {
                    self.data_generated += 1;
                    let payload = Payload::Data { message: self.config.message.clone() };
                    let i = self.radio.generate_packet(now, payload, Destination::Broadcast);
                    return StepOutput::interrupt(Some(i));
                }
                StepOutput::idle()
            }
            RelayState::Sensing { remaining } => {
                // Only signals this radio can actually hear count as
                // channel activity.
                let location = self.radio.location();
                let sensitivity = self.radio.sensitivity();
                let busy = medium
                    .bucket(self.radio.channel(), self.radio.sf())
                    .unwrap_or(&[])
                    .iter()
                    .any(|record| {
                        let d = phy::distance(&record.signal.source_location, &location);
                        phy::received_power(
                            d,
                            record.signal.tx_power_dbm,
                            phy::DEFAULT_SHADOWING_DB,
                        ) >= sensitivity
                    });
                if busy {
                    StepOutput::interrupt(Some(Interrupt::ChannelBusy))
                } else if remaining == 0 {
                    StepOutput::interrupt(Some(Interrupt::ChannelClear))
                } else {
                    self.state = RelayState::Sensing { remaining: remaining - 1 };
                    StepOutput::idle()
                }
            }
            RelayState::Transmitting { .. } => {
                let (interrupt, signal) = self.radio.transmit_packet();
                let beacon = self.wurx.transmit_beacon();
                StepOutput { interrupt, signal, beacon }
            }
        }
    }

    fn drive(&mut self, interrupt: Option<Interrupt>, now: Tick) {
        // Reply delays run regardless of state.
        let delay = self.config.reply_delay;
        let mut matured = Vec::new();
        self.pending.retain_mut(|reply| {
            if reply.timer.step(delay) == Some(Interrupt::DelayEnd) {
                matured.push(ReadyReply {
                    source: reply.source.clone(),
                    channel: reply.channel,
                    sf: reply.sf,
                    received_power: reply.received_power,
                });
                false
            } else {
                true
            }
        });
        self.ready.extend(matured);

        if let Some(interrupt) = interrupt {
            match (self.state, interrupt) {
                (RelayState::JoinDelay { .. }, Interrupt::DelayEnd) => {
                    self.radio.generate_packet(now, Payload::JoinRequest, Destination::Broadcast);
                    self.state = RelayState::JoinTransmit;
                }
                (RelayState::JoinTransmit, Interrupt::TransmissionEnd) => {
                    self.state = RelayState::JoinRxDelay { slot: RxSlot::Rx1 };
                }
                (RelayState::JoinRxDelay { slot }, Interrupt::DelayEnd) => {
                    self.state = RelayState::JoinRxWindow { slot };
                }
                (RelayState::JoinRxWindow { slot }, Interrupt::PacketDecoded) => {
                    match self.take_join_accept() {
                        Some((answer, upstream)) => self.complete_join(answer, upstream),
                        None => self.window_failed(slot),
                    }
                }
                (
                    RelayState::JoinRxWindow { slot },
                    Interrupt::PacketNonDecoded | Interrupt::RxTimeout,
                ) => {
                    self.window_failed(slot);
                }
                (RelayState::Listening { .. }, Interrupt::PacketDecoded) => {
                    if self.harvest() {
                        self.state = RelayState::Sensing { remaining: self.sensing_window() };
                    }
                }
                (RelayState::Listening { .. }, Interrupt::PacketNonDecoded) => {
                    // A broken reception restarts the listen window.
                    self.state =
                        RelayState::Listening { remaining: self.config.listen_window };
                }
                (RelayState::Listening { .. }, Interrupt::GeneratePacket) => {
                    self.state = RelayState::Sensing { remaining: self.sensing_window() };
                }
                (RelayState::Listening { .. }, Interrupt::DelayEnd) => {
                    trace!(relay = %self.radio.id(), tick = now, "listen window over, sleeping");
                    self.state = RelayState::Sleeping;
                }
                (RelayState::Sleeping, Interrupt::WakeUp) => {
                    debug!(relay = %self.radio.id(), tick = now, "woken by beacon");
                    self.state =
                        RelayState::Listening { remaining: self.config.listen_window };
                }
                (RelayState::Sleeping, Interrupt::GeneratePacket) => {
                    self.state = RelayState::Sensing { remaining: self.sensing_window() };
                }
                (RelayState::Sensing { .. }, Interrupt::ChannelBusy) => {
                    let window = self.sensing_window();
                    trace!(relay = %self.radio.id(), window, "channel busy, sensing restarted");
                    self.state = RelayState::Sensing { remaining: window };
                }
                (RelayState::Sensing { .. }, Interrupt::ChannelClear) => {
                    self.state = RelayState::Transmitting { reply: false };
                }
                (RelayState::Transmitting { reply }, Interrupt::TransmissionEnd) => {
                    if reply {
                        let (channel, sf) = self.home;
                        let _ = self.radio.retune(channel, sf);
                    }
                    self.state =
                        RelayState::Listening { remaining: self.config.listen_window };
                }
                _ => {}
            }
        }

        // A matured reply is picked up as soon as the relay is not busy
        // with its own exchange.
        if matches!(self.state, RelayState::Listening { .. } | RelayState::Sleeping)
            && !self.ready.is_empty()
        {
            self.stage_reply(now);
        }
    }

    fn joined(&self) -> bool {
        self.joined
    }

    fn generated_data(&self) -> u64 {
        self.data_generated
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RadioParams {
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

    fn wurx_params() -> WakeUpRadioParams {
        WakeUpRadioParams {
            center_frequency_mhz: 868.0,
            bandwidth_mhz: 0.2,
            modulation: "RZ-OOK".into(),
            code_length_bits: 11,
            sensitivity_dbm: -80.9,
            latency_ms: 16,
            transmission_power_dbm: 14.0,
            false_alarm_rate_per_hour: 0.1,
            missed_detection_ratio_at_sensitivity: 0.01,
        }
    }

    /// Minimal two-phase loop over a set of devices.
    fn run(devices: &mut [&mut dyn Device], medium: &mut Medium, start: Tick, ticks: u64) -> Tick {
        let mut now = start;
        for _ in 0..ticks {
            let mut interrupts: Vec<Option<Interrupt>> = vec![None; devices.len()];
            let mut transmitted = vec![false; devices.len()];
            for (i, device) in devices.iter_mut().enumerate() {
                if device.wants_transmit() {
                    transmitted[i] = true;
                    let out = device.execute(now, medium);
                    if let Some(signal) = out.signal {
                        medium.insert(signal).unwrap();
                    }
                    if let Some(beacon) = out.beacon {
                        medium.insert_beacon(beacon);
                    }
                    interrupts[i] = out.interrupt;
                }
            }
            for (i, device) in devices.iter_mut().enumerate() {
                if !transmitted[i] {
                    interrupts[i] = device.execute(now, medium).interrupt;
                }
            }
            for (i, device) in devices.iter_mut().enumerate() {
                device.drive(interrupts[i], now);
            }
            medium.tick();
            now += 1;
        }
        now
    }

    fn class_a_node(id: &str, x: f64, probability: f64, join: bool) -> ClassANode {
        let id = DeviceId::new(id);
        let traffic = TrafficModel::new(&id, probability, 7);
        let config = ClassANodeConfig {
            join_enabled: join,
            receiving_windows_enabled: false,
            ..ClassANodeConfig::default()
        };
        ClassANode::new(id, params(), Location::new(x, 0.0), config, traffic).unwrap()
    }

    #[test]
    fn test_suggest_sf_picks_lowest_clearing_sf() {
        let gw = Gateway::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
            GatewayConfig::default(),
        )
        .unwrap();
        assert_eq!(gw.suggest_sf(-100.0), 7);
        assert_eq!(gw.suggest_sf(-123.0), 7);
        assert_eq!(gw.suggest_sf(-125.0), 8);
        assert_eq!(gw.suggest_sf(-133.0), 11);
        assert_eq!(gw.suggest_sf(-150.0), 12);
    }

    #[test]
    fn test_traffic_model_deterministic() {
        let id = DeviceId::new("n1");
        let mut a = TrafficModel::new(&id, 0.25, 42);
        let mut b = TrafficModel::new(&id, 0.25, 42);
        let sa: Vec<bool> = (0..256).map(|_| a.fires()).collect();
        let sb: Vec<bool> = (0..256).map(|_| b.fires()).collect();
        assert_eq!(sa, sb);
        assert!(sa.iter().any(|&f| f));
        assert!(sa.iter().any(|&f| !f));
    }

    #[test]
    fn test_traffic_model_silent() {
        let id = DeviceId::new("n1");
        let mut t = TrafficModel::silent(&id);
        assert!((0..1000).all(|_| !t.fires()));
    }

    #[test]
    fn test_node_without_join_sends_data() {
        let mut medium = Medium::new();
        let mut node = class_a_node("n1", 1.0, 0.01, false);
        let mut gw = Gateway::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
            GatewayConfig::default(),
        )
        .unwrap();
        assert!(node.joined());

        let mut devices: Vec<&mut dyn Device> = vec![&mut node, &mut gw];
        run(&mut devices, &mut medium, 0, 20_000);

        let generated = node.generated_data();
        let received = gw.received_data().map(|r| r.len() as u64).unwrap_or(0);
        assert!(generated > 0, "traffic source never fired");
        // At most the final packet may still be in flight when the run ends.
        assert!(generated - received <= 1, "{} generated, {} received", generated, received);
    }

    #[test]
    fn test_class_a_join_exchange() {
        let mut medium = Medium::new();
        let mut node = class_a_node("n1", 1.0, 0.0, true);
        let mut gw = Gateway::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
            GatewayConfig::default(),
        )
        .unwrap();
        assert!(!node.joined());

        let mut devices: Vec<&mut dyn Device> = vec![&mut node, &mut gw];
        // Contention delay (at most 6400) + request + 5000 reply delay +
        // windows fits comfortably in 20k ticks.
        run(&mut devices, &mut medium, 0, 20_000);

        assert!(node.joined(), "join exchange did not converge");
        // Strong link at 1 m: rx = 14 - 43 = -29 dBm, so SF7 is suggested
        // and the tuning is unchanged.
        assert_eq!(node.radio().sf(), 7);
    }

    #[test]
    fn test_multiple_nodes_all_join() {
        let mut medium = Medium::new();
        let mut nodes: Vec<ClassANode> = (0..4)
            .map(|i| class_a_node(&format!("n{}", i), 1.0 + i as f64, 0.0, true))
            .collect();
        let mut gw = Gateway::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
            GatewayConfig::default(),
        )
        .unwrap();

        {
            let mut devices: Vec<&mut dyn Device> = nodes
                .iter_mut()
                .map(|n| n as &mut dyn Device)
                .chain(std::iter::once(&mut gw as &mut dyn Device))
                .collect();
            run(&mut devices, &mut medium, 0, 120_000);
        }

        for node in &nodes {
            assert!(node.joined(), "{} failed to join", node.id());
        }
    }

    #[test]
    fn test_multihop_gateway_assigns_cluster() {
        let mut medium = Medium::new();
        let mut node = class_a_node("n1", 1.0, 0.0, true);
        let mut gw = Gateway::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
            GatewayConfig { reply_delay: 5000, mode: GatewayMode::Multihop { cluster_channel: 4 } },
        )
        .unwrap();

        let mut devices: Vec<&mut dyn Device> = vec![&mut node, &mut gw];
        run(&mut devices, &mut medium, 0, 20_000);

        assert!(node.joined());
        assert_eq!(node.radio().channel(), 4);
        assert_eq!(node.hop_depth(), 1);
        assert_eq!(node.parent(), Some(&DeviceId::new("gw")));
    }

    #[test]
    fn test_relay_joins_and_answers_requests() {
        let mut medium = Medium::new();
        let id = DeviceId::new("r1");
        let traffic = TrafficModel::silent(&id);
        let mut relay = RelayNode::new(
            id,
            params(),
            wurx_params(),
            Location::new(1.0, 0.0),
            RelayNodeConfig::default(),
            traffic,
        )
        .unwrap();
        let mut gw = Gateway::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
            GatewayConfig { reply_delay: 5000, mode: GatewayMode::Multihop { cluster_channel: 4 } },
        )
        .unwrap();

        let now = {
            let mut devices: Vec<&mut dyn Device> = vec![&mut relay, &mut gw];
            run(&mut devices, &mut medium, 0, 30_000)
        };
        assert!(relay.joined());
        assert_eq!(relay.hop_depth(), 1);
        assert_eq!(relay.radio().channel(), 4);
        assert_eq!(relay.parent(), Some(&DeviceId::new("gw")));

        // A leaf with a wake-up radio now joins through the relay. It must
        // request on the cluster channel the relay listens on.
        let leaf_id = DeviceId::new("leaf");
        let mut leaf_params = params();
        leaf_params.channel = 4;
        let leaf_traffic = TrafficModel::silent(&leaf_id);
        let config = ClassANodeConfig {
            receiving_windows_enabled: false,
            ..ClassANodeConfig::default()
        };
        let mut leaf = ClassANode::new(
            leaf_id,
            leaf_params,
            Location::new(1.5, 0.0),
            config,
            leaf_traffic,
        )
        .unwrap()
        .with_wake_up_radio(wurx_params());

        {
            let mut devices: Vec<&mut dyn Device> =
                vec![&mut leaf, &mut relay, &mut gw];
            run(&mut devices, &mut medium, now, 120_000);
        }
        assert!(leaf.joined(), "leaf failed to join through the relay");
        assert_eq!(leaf.hop_depth(), 2);
        assert_eq!(leaf.parent(), Some(&DeviceId::new("r1")));
    }

    #[test]
    fn test_relay_rejects_requests_outside_wake_range() {
        // rx power must clear the wake-up sensitivity (-80.9 dBm). At
        // 100 m the request arrives at 14 - 37 - 60 - 6 = -89 dBm: decodable
        // by LoRa but outside wake range.
        let mut medium = Medium::new();
        let id = DeviceId::new("r1");
        let traffic = TrafficModel::silent(&id);
        let mut relay = RelayNode::new(
            id,
            params(),
            wurx_params(),
            Location::new(0.0, 0.0),
            RelayNodeConfig::default(),
            traffic,
        )
        .unwrap();
        // Force the relay straight into its listening state.
        relay.joined = true;
        relay.state = RelayState::Listening { remaining: relay.config.listen_window };

        let mut far = class_a_node("far", 100.0, 0.0, true);
        let mut devices: Vec<&mut dyn Device> = vec![&mut far, &mut relay];
        run(&mut devices, &mut medium, 0, 30_000);

        assert!(relay.pending.is_empty());
        assert!(relay.ready.is_empty());
        assert!(!far.joined());
    }

    #[test]
    fn test_gateway_demodulator_cap() {
        // Nine lockstep transmissions on nine distinct slots: only eight
        // demodulation paths exist, so exactly one packet is lost.
        let mut medium = Medium::new();
        let mut sources = Vec::new();
        for i in 0..9u8 {
            let mut p = params();
            p.channel = i + 1;
            let mut radio = LoRaModule::new(
                DeviceId::new(format!("n{}", i)),
                p,
                Location::new(1.0, 0.0),
            )
            .unwrap();
            radio.generate_packet(0, Payload::Data { message: "x".into() }, Destination::Broadcast);
            sources.push(radio);
        }

        let mut gw = Gateway::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
            GatewayConfig::default(),
        )
        .unwrap();
        for now in 0.. {
            let mut on_air = false;
            for radio in &mut sources {
                if let (Some(_), Some(signal)) = radio.transmit_packet() {
                    medium.insert(signal).unwrap();
                    on_air = true;
                }
            }
            if !on_air {
                break;
            }
            gw.execute(now, &medium);
            medium.tick();
        }
        let received = gw.received_data().map(|r| r.len()).unwrap_or(0);
        assert_eq!(received, MAX_PARALLEL_DEMODULATORS);
    }

    #[test]
    fn test_data_window_requires_addressed_downlink() {
        let mut node = class_a_node("n1", 1.0, 0.0, false);
        let mut gw_radio = LoRaModule::new(
            DeviceId::new("gw"),
            params(),
            Location::new(0.0, 0.0),
        )
        .unwrap();

        // A decoded accept meant for another node does not acknowledge.
        node.state = ClassAState::RxWindow { exchange: Exchange::Data, slot: RxSlot::Rx1 };
        gw_radio.generate_packet(
            0,
            Payload::JoinAccept(JoinAnswer::ClassA { suggested_sf: 7 }),
            Destination::Device(DeviceId::new("other")),
        );
        node.radio.forward_packet(gw_radio.pop_outbound().unwrap());
        node.drive(Some(Interrupt::PacketDecoded), 0);
        assert!(matches!(
            node.state,
            ClassAState::RxDelay { exchange: Exchange::Data, slot: RxSlot::Rx2 }
        ));

        // A downlink addressed to this node closes the window.
        node.state = ClassAState::RxWindow { exchange: Exchange::Data, slot: RxSlot::Rx2 };
        gw_radio.generate_packet(
            0,
            Payload::Data { message: "ack".into() },
            Destination::Device(DeviceId::new("n1")),
        );
        node.radio.forward_packet(gw_radio.pop_outbound().unwrap());
        node.drive(Some(Interrupt::PacketDecoded), 0);
        assert!(matches!(node.state, ClassAState::Idle));
    }

    #[test]
    fn test_sensing_restarts_on_busy_channel() {
        let mut medium = Medium::new();
        let id = DeviceId::new("r1");
        let traffic = TrafficModel::silent(&id);
        let mut relay = RelayNode::new(
            id,
            params(),
            wurx_params(),
            Location::new(0.0, 0.0),
            RelayNodeConfig::default(),
            traffic,
        )
        .unwrap();
        relay.joined = true;
        relay.state = RelayState::Sensing { remaining: 3 };

        // Occupy the relay's slot.
        let mut other = LoRaModule::new(
            DeviceId::new("n1"),
            params(),
            Location::new(1.0, 0.0),
        )
        .unwrap();
        other.generate_packet(0, Payload::Data { message: "x".into() }, Destination::Broadcast);
        let (_, signal) = other.transmit_packet();
        medium.insert(signal.unwrap()).unwrap();

        let out = relay.execute(0, &medium);
        assert_eq!(out.interrupt, Some(Interrupt::ChannelBusy));
        relay.drive(out.interrupt, 0);
        let RelayState::Sensing { remaining } = relay.state else {
            panic!("relay left the sensing state");
        };
        assert!((relay.config.sensing.min..=relay.config.sensing.max).contains(&remaining));

        // Clear medium; the drawn window must elapse before the channel is
        // declared clear.
        medium.tick();
        let mut clear = None;
        for tick in 1..=relay.config.sensing.max + 2 {
            let out = relay.execute(tick, &medium);
            if out.interrupt == Some(Interrupt::ChannelClear) {
                clear = Some(tick);
                break;
            }
        }
        assert_eq!(clear, Some(remaining + 1));
    }

    #[test]
    fn test_contention_delays_differ_across_attempts() {
        let mut node = class_a_node("n1", 1.0, 0.0, true);
        let d0 = node.contention_delay();
        let delays: HashSet<u64> = (0..16)
            .map(|attempt| {
                node.attempts = attempt;
                node.contention_delay()
            })
            .collect();
        node.attempts = 0;
        assert_eq!(node.contention_delay(), d0, "delays must be reproducible");
        assert!(delays.len() > 1, "retries never move to another slot");
        for delay in delays {
            assert!(delay >= node.config.contention_slot_ticks);
            assert_eq!(delay % node.config.contention_slot_ticks, 0);
        }
    }
}
