//! # lpwansim-radio
//!
//! Radio modules and wire-level data model for the LPWAN simulator.
//!
//! This crate provides:
//! - Packet and signal types ([`Packet`], [`WirelessSignal`], [`WakeUpBeacon`])
//! - Radio parameter configuration ([`RadioParams`], [`WakeUpRadioParams`])
//! - The per-device LoRa radio ([`LoRaModule`])
//! - The ultra-low-power wake-up receiver ([`WakeUpRadioModule`])
//! - The interrupt vocabulary consumed by protocol drivers ([`Interrupt`])
//!
//! Radio modules are state-machine *primitives*, not state machines: every
//! operation advances internal buffers by at most one step and reports what
//! happened as an [`Interrupt`]. Receive sampling works on in-flight record
//! slices handed over by the shared medium, so this crate stays independent
//! of the medium's bucket bookkeeping.

use lpwansim_phy as phy;
use lpwansim_phy::Location;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

// ============================================================================
// Basic Types
// ============================================================================

/// Simulation time in ticks. One tick corresponds to one millisecond.
pub type Tick = u64;

/// Lowest valid LoRa channel.
pub const MIN_CHANNEL: u8 = 1;
/// Highest valid LoRa channel (nine EU868 125-kHz channels).
pub const MAX_CHANNEL: u8 = 9;
/// Lowest valid spreading factor.
pub const MIN_SF: u8 = 7;
/// Highest valid spreading factor.
pub const MAX_SF: u8 = 12;

/// Power margin required for the capture effect, in dB. If the strongest of
/// two colliding signals exceeds the runner-up by at least this much it is
/// decoded; otherwise both are lost.
pub const CAPTURE_MARGIN_DB: f64 = 6.0;

/// Wire size of a join request in bytes (LoRaWAN OTAA JoinRequest).
pub const JOIN_REQUEST_BYTES: usize = 18;
/// Wire size of a join accept in bytes (12-byte frame plus 16-byte MIC/keys).
pub const JOIN_ACCEPT_BYTES: usize = 28;

/// Identity of a device (node or gateway).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a device id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Addressee of a packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Anyone listening on the right channel and spreading factor.
    Broadcast,
    /// A specific device.
    Device(DeviceId),
}

impl Destination {
    /// Whether a device with `id` should accept a packet with this
    /// destination.
    pub fn matches(&self, id: &DeviceId) -> bool {
        match self {
            Destination::Broadcast => true,
            Destination::Device(dest) => dest == id,
        }
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Join accept contents; the shape depends on who answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinAnswer {
    /// A LoRaWAN gateway suggests a spreading factor derived from the
    /// request's received power.
    ClassA {
        /// Suggested spreading factor (7-12).
        suggested_sf: u8,
    },
    /// A multihop relay or gateway assigns cluster membership.
    Multihop {
        /// Channel the cluster communicates on.
        cluster_channel: u8,
        /// Relay hops between the joiner and the gateway.
        hop_depth: u8,
    },
}

/// Application-level packet contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Payload {
    /// An ordinary uplink message.
    Data {
        /// Message body.
        message: String,
    },
    /// OTAA join request.
    JoinRequest,
    /// OTAA join accept.
    JoinAccept(JoinAnswer),
}

impl Payload {
    /// Size of this payload on the wire in bytes.
    pub fn byte_len(&self) -> usize {
        match self {
            Payload::Data { message } => message.len(),
            Payload::JoinRequest => JOIN_REQUEST_BYTES,
            Payload::JoinAccept(_) => JOIN_ACCEPT_BYTES,
        }
    }
}

// ============================================================================
// Packets and Signals
// ============================================================================

/// Unique identity of an application packet: who sent it, to whom, and when
/// it was generated. Fragments of the same packet share the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PacketId {
    /// Originating device.
    pub source: DeviceId,
    /// Addressee.
    pub destination: Destination,
    /// Tick the packet was generated at.
    pub generation_time: Tick,
}

/// One application message, possibly spanning several airtime fragments.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet identity (shared by all fragments).
    pub id: PacketId,
    /// Originating device.
    pub source: DeviceId,
    /// Addressee.
    pub destination: Destination,
    /// Tick the packet was generated at.
    pub generation_time: Tick,
    /// Application contents.
    pub payload: Payload,
    /// Total number of airtime fragments the packet occupies.
    pub segments_required: u64,
    /// Fragments still to be transmitted (counts down).
    pub segments_left: u64,
    /// Whether this is the first fragment of the packet.
    pub first_fragment: bool,
    /// Channel the packet was generated under.
    pub channel: u8,
    /// Spreading factor the packet was generated under.
    pub sf: u8,
    /// Tick the packet was decoded at, if it has been.
    pub reception_time: Option<Tick>,
    /// Received power of the strongest fragment, stamped at reception.
    pub received_power: Option<f64>,
}

/// A packet in flight: the packet plus the transmitter's tuning at the
/// moment of transmission.
#[derive(Debug, Clone)]
pub struct WirelessSignal {
    /// The fragment being carried.
    pub packet: Packet,
    /// Channel occupied.
    pub channel: u8,
    /// Spreading factor occupied.
    pub sf: u8,
    /// Bandwidth in kHz.
    pub bandwidth_khz: u32,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Transmitter position.
    pub source_location: Location,
}

/// A live medium record: a signal plus its remaining airtime countdown.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// The signal over the air.
    pub signal: WirelessSignal,
    /// Ticks of airtime still to elapse. The record is visible while >= 0.
    pub toa_left: i64,
}

/// A tiny out-of-band wake signal.
#[derive(Debug, Clone)]
pub struct WakeUpBeacon {
    /// Beacon identity (source id plus generation tick).
    pub id: String,
    /// Tick the beacon was generated at.
    pub generation_time: Tick,
}

/// A wake-up beacon in flight.
#[derive(Debug, Clone)]
pub struct WakeUpSignal {
    /// The beacon being carried.
    pub beacon: WakeUpBeacon,
    /// Transmit power in dBm.
    pub tx_power_dbm: f64,
    /// Transmitter position.
    pub source_location: Location,
    /// Nominal airtime (equals the receiver's decode latency).
    pub airtime: u64,
}

/// A live wake-up beacon record in the medium.
#[derive(Debug, Clone)]
pub struct BeaconInFlight {
    /// The signal over the air.
    pub signal: WakeUpSignal,
    /// Ticks of airtime still to elapse.
    pub toa_left: i64,
}

// ============================================================================
// Interrupts
// ============================================================================

/// Events produced by radio module operations and folded through protocol
/// drivers to decide the device's next action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// A packet was appended to the outbound queue.
    GeneratePacket,
    /// A fragment went on air but more fragments remain.
    TransmissionStart,
    /// The final fragment of a packet went on air.
    TransmissionEnd,
    /// The first fragment of an incoming packet was captured.
    ReceiveStart,
    /// At least one buffered packet reassembled successfully.
    PacketDecoded,
    /// Reassembly was attempted and nothing decoded.
    PacketNonDecoded,
    /// A suspend timer started.
    DelayStart,
    /// A suspend timer reached its terminal tick.
    DelayEnd,
    /// A receive window expired with nothing buffered.
    RxTimeout,
    /// A join accept addressed to this device was decoded.
    JoinAcceptSuccess,
    /// The decoded packet was not a join accept for this device.
    JoinAcceptFailed,
    /// Carrier sense found the target slot occupied.
    ChannelBusy,
    /// Carrier sense window elapsed with the slot clear.
    ChannelClear,
    /// The wake-up receiver matched a beacon.
    WakeUp,
}

// ============================================================================
// Configuration
// ============================================================================

/// Errors raised while loading or validating radio configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading a parameter file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or incomplete JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tuning outside the supported channel/SF ranges.
    #[error("invalid tuning: channel {channel}, SF {sf}")]
    InvalidTuning {
        /// Offending channel.
        channel: u8,
        /// Offending spreading factor.
        sf: u8,
    },
}

/// LoRa radio parameters, loaded from a JSON parameter file.
///
/// Every key is required; a missing or mistyped key fails at load time.
#[derive(Debug, Clone, Deserialize)]
pub struct RadioParams {
    /// Default spreading factor (7-12).
    pub sf: u8,
    /// Default channel (1-9).
    pub channel: u8,
    /// Bandwidth in kHz.
    pub bandwidth: u32,
    /// Transmit power in dBm.
    #[serde(rename = "PowerTX")]
    pub power_tx: f64,
    /// Sensitivity threshold at SF7 in dBm.
    #[serde(rename = "RSSI_sf7")]
    pub rssi_sf7: f64,
    /// Sensitivity threshold at SF8 in dBm.
    #[serde(rename = "RSSI_sf8")]
    pub rssi_sf8: f64,
    /// Sensitivity threshold at SF9 in dBm.
    #[serde(rename = "RSSI_sf9")]
    pub rssi_sf9: f64,
    /// Sensitivity threshold at SF10 in dBm.
    #[serde(rename = "RSSI_sf10")]
    pub rssi_sf10: f64,
    /// Sensitivity threshold at SF11 in dBm.
    #[serde(rename = "RSSI_sf11")]
    pub rssi_sf11: f64,
    /// Sensitivity threshold at SF12 in dBm.
    #[serde(rename = "RSSI_sf12")]
    pub rssi_sf12: f64,
}

impl RadioParams {
    /// Load parameters from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Sensitivity threshold in dBm for a spreading factor.
    ///
    /// # Panics
    ///
    /// Panics if `sf` is outside 7-12; tunings are validated before use.
    pub fn sensitivity(&self, sf: u8) -> f64 {
        match sf {
            7 => self.rssi_sf7,
            8 => self.rssi_sf8,
            9 => self.rssi_sf9,
            10 => self.rssi_sf10,
            11 => self.rssi_sf11,
            12 => self.rssi_sf12,
            _ => unreachable!("tuning validated on construction"),
        }
    }
}

/// Wake-up receiver parameters, loaded from a JSON parameter file.
#[derive(Debug, Clone, Deserialize)]
pub struct WakeUpRadioParams {
    /// Center frequency in MHz.
    #[serde(rename = "center_frequency_MHz")]
    pub center_frequency_mhz: f64,
    /// Receiver bandwidth in MHz.
    #[serde(rename = "bandwidth_MHz")]
    pub bandwidth_mhz: f64,
    /// Modulation name, e.g. "RZ-OOK".
    pub modulation: String,
    /// Wake code length in bits.
    pub code_length_bits: u32,
    /// Detection sensitivity in dBm.
    #[serde(rename = "sensitivity_dBm")]
    pub sensitivity_dbm: f64,
    /// Decode latency in milliseconds.
    pub latency_ms: u64,
    /// Beacon transmit power in dBm.
    #[serde(rename = "transmission_power_dBm")]
    pub transmission_power_dbm: f64,
    /// Datasheet false alarm rate.
    pub false_alarm_rate_per_hour: f64,
    /// Datasheet missed detection ratio at sensitivity.
    pub missed_detection_ratio_at_sensitivity: f64,
}

impl WakeUpRadioParams {
    /// Load parameters from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ============================================================================
// Countdown
// ============================================================================

/// The single suspend primitive behind every timed wait.
///
/// A countdown is idle until stepped; the first step arms it and reports
/// [`Interrupt::DelayStart`], subsequent steps decrement silently and the
/// terminal step clears it and reports [`Interrupt::DelayEnd`]. Protocol
/// drivers guarantee that only one logical wait uses the countdown at a
/// time.
#[derive(Debug, Clone, Default)]
pub struct Countdown {
    remaining: Option<u64>,
}

impl Countdown {
    /// Step the countdown towards a wait of `duration` ticks.
    pub fn step(&mut self, duration: u64) -> Option<Interrupt> {
        match self.remaining {
            None => {
                self.remaining = Some(duration.saturating_sub(1));
                Some(Interrupt::DelayStart)
            }
            Some(0) => {
                self.remaining = None;
                Some(Interrupt::DelayEnd)
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                None
            }
        }
    }

    /// Abandon the wait. The next step arms a fresh countdown.
    pub fn cancel(&mut self) {
        self.remaining = None;
    }

    /// Whether no wait is in progress.
    pub fn is_idle(&self) -> bool {
        self.remaining.is_none()
    }
}

// ============================================================================
// LoRa Module
// ============================================================================

/// Per-device LoRa radio: outbound queue, inbound fragment buffer and
/// tuning. Owned by exactly one device.
#[derive(Debug)]
pub struct LoRaModule {
    id: DeviceId,
    location: Location,
    params: RadioParams,

    channel: u8,
    sf: u8,
    bandwidth_khz: u32,
    tx_power_dbm: f64,
    sensitivity_dbm: f64,

    outbound: VecDeque<Packet>,
    inbound: Vec<Packet>,
    timer: Countdown,

    generated: u64,
    decoded_ids: HashSet<PacketId>,
}

impl LoRaModule {
    /// Create a radio tuned to the parameter file's defaults.
    pub fn new(id: DeviceId, params: RadioParams, location: Location) -> Result<Self, ConfigError> {
        validate_tuning(params.channel, params.sf)?;
        let sensitivity = params.sensitivity(params.sf);
        Ok(LoRaModule {
            id,
            location,
            channel: params.channel,
            sf: params.sf,
            bandwidth_khz: params.bandwidth,
            tx_power_dbm: params.power_tx,
            sensitivity_dbm: sensitivity,
            params,
            outbound: VecDeque::new(),
            inbound: Vec::new(),
            timer: Countdown::default(),
            generated: 0,
            decoded_ids: HashSet::new(),
        })
    }

    /// Create a radio with an explicit initial tuning.
    pub fn with_tuning(
        id: DeviceId,
        params: RadioParams,
        location: Location,
        channel: u8,
        sf: u8,
    ) -> Result<Self, ConfigError> {
        let mut module = Self::new(id, params, location)?;
        module.retune(channel, sf)?;
        Ok(module)
    }

    /// Device identity this radio belongs to.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Radio position.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Current channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Current spreading factor.
    pub fn sf(&self) -> u8 {
        self.sf
    }

    /// Bandwidth in kHz.
    pub fn bandwidth_khz(&self) -> u32 {
        self.bandwidth_khz
    }

    /// Active sensitivity threshold in dBm for the current tuning.
    pub fn sensitivity(&self) -> f64 {
        self.sensitivity_dbm
    }

    /// Sensitivity threshold in dBm for an arbitrary spreading factor.
    pub fn sensitivity_at(&self, sf: u8) -> f64 {
        self.params.sensitivity(sf)
    }

    /// Total packets generated by this radio.
    pub fn generated_packets(&self) -> u64 {
        self.generated
    }

    /// Ids of every packet this radio decoded successfully.
    pub fn decoded_ids(&self) -> &HashSet<PacketId> {
        &self.decoded_ids
    }

    /// Number of packets waiting in the outbound queue.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Whether any inbound fragments are buffered.
    pub fn has_buffered_fragments(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Number of inbound fragments currently buffered.
    pub fn buffered_fragments(&self) -> usize {
        self.inbound.len()
    }

    /// Pop the oldest outbound packet, if any. Protocol drivers use this to
    /// inspect decoded packets forwarded into the queue.
    pub fn pop_outbound(&mut self) -> Option<Packet> {
        self.outbound.pop_front()
    }

    /// Drop every queued outbound packet.
    pub fn clear_outbound(&mut self) {
        self.outbound.clear();
    }

    /// Retune the radio, updating the active sensitivity. Buffered fragments
    /// recorded under the old tuning become ineligible for reassembly.
    pub fn retune(&mut self, channel: u8, sf: u8) -> Result<(), ConfigError> {
        validate_tuning(channel, sf)?;
        self.channel = channel;
        self.sf = sf;
        self.sensitivity_dbm = self.params.sensitivity(sf);
        Ok(())
    }

    /// Step the suspend timer towards a wait of `duration` ticks.
    pub fn sleep_delay(&mut self, duration: u64) -> Option<Interrupt> {
        self.timer.step(duration)
    }

    /// Abandon the pending timed wait.
    pub fn cancel_timer(&mut self) {
        self.timer.cancel();
    }

    /// Build a new packet and queue it for transmission.
    ///
    /// The packet is stamped with the current tuning and its airtime is
    /// split into one fragment per tick of time on air.
    pub fn generate_packet(
        &mut self,
        now: Tick,
        payload: Payload,
        destination: Destination,
    ) -> Interrupt {
        let segments = phy::airtime_ticks(payload.byte_len(), self.sf, self.bandwidth_khz).max(1);
        let id = PacketId {
            source: self.id.clone(),
            destination: destination.clone(),
            generation_time: now,
        };
        trace!(device = %self.id, tick = now, segments, "generated packet");
        self.outbound.push_back(Packet {
            id,
            source: self.id.clone(),
            destination,
            generation_time: now,
            payload,
            segments_required: segments,
            segments_left: segments,
            first_fragment: true,
            channel: self.channel,
            sf: self.sf,
            reception_time: None,
            received_power: None,
        });
        self.generated += 1;
        Interrupt::GeneratePacket
    }

    /// Re-queue a decoded packet for onward transmission under the current
    /// tuning. The packet keeps its identity, so end-to-end delivery is
    /// still counted once, but its fragmentation is recomputed for the
    /// forwarding radio's tuning.
    pub fn forward_packet(&mut self, mut packet: Packet) -> Interrupt {
        let segments = phy::airtime_ticks(packet.payload.byte_len(), self.sf, self.bandwidth_khz).max(1);
        packet.segments_required = segments;
        packet.segments_left = segments;
        packet.first_fragment = true;
        packet.channel = self.channel;
        packet.sf = self.sf;
        packet.received_power = None;
        self.outbound.push_back(packet);
        Interrupt::GeneratePacket
    }

    /// Send the next fragment of the oldest queued packet.
    ///
    /// A packet with more than one fragment left is cloned back to the head
    /// of the queue with its countdown decremented, so the remaining
    /// fragments go out on consecutive ticks.
    pub fn transmit_packet(&mut self) -> (Option<Interrupt>, Option<WirelessSignal>) {
        let packet = match self.outbound.pop_front() {
            Some(packet) => packet,
            None => return (None, None),
        };

        let interrupt = if packet.segments_left > 1 {
            let mut rest = packet.clone();
            rest.segments_left -= 1;
            rest.first_fragment = false;
            self.outbound.push_front(rest);
            Interrupt::TransmissionStart
        } else {
            Interrupt::TransmissionEnd
        };

        let signal = WirelessSignal {
            packet,
            channel: self.channel,
            sf: self.sf,
            bandwidth_khz: self.bandwidth_khz,
            tx_power_dbm: self.tx_power_dbm,
            source_location: self.location,
        };
        (Some(interrupt), Some(signal))
    }

    /// Sample one tick of the medium bucket matching the current tuning.
    ///
    /// Candidates below the active sensitivity are ignored. A single
    /// survivor, or a strongest survivor at least [`CAPTURE_MARGIN_DB`]
    /// above the runner-up, has its fragment buffered; closer contests are
    /// collisions and capture nothing.
    pub fn receive_partial(&mut self, now: Tick, candidates: &[InFlight]) -> Option<Interrupt> {
        let mut heard: Vec<(&InFlight, f64)> = candidates
            .iter()
            .filter_map(|record| {
                let d = phy::distance(&record.signal.source_location, &self.location);
                let rx = phy::received_power(
                    d,
                    record.signal.tx_power_dbm,
                    phy::DEFAULT_SHADOWING_DB,
                );
                (rx >= self.sensitivity_dbm).then_some((record, rx))
            })
            .collect();

        if heard.is_empty() {
            return None;
        }

        // Stable sort keeps insertion order on ties, which the medium hands
        // over deterministically.
        heard.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let (winner, rx_power) = heard[0];
        if heard.len() > 1 && heard[0].1 - heard[1].1 < CAPTURE_MARGIN_DB {
            debug!(
                device = %self.id,
                strongest = heard[0].1,
                runner_up = heard[1].1,
                "collision within capture margin"
            );
            return None;
        }

        let mut fragment = winner.signal.packet.clone();
        fragment.received_power = Some(rx_power);
        let first = fragment.first_fragment;
        self.buffer_fragment(fragment);

        if winner.toa_left == 0 {
            Some(self.decode(now, winner.signal.packet.segments_required))
        } else if first {
            Some(Interrupt::ReceiveStart)
        } else {
            None
        }
    }

    /// Attempt reassembly of the buffered fragments.
    ///
    /// Fragments are grouped by packet id, restricted to the current tuning.
    /// A group decodes iff its fragment count is within one (inclusive) of
    /// `segments_required` — tolerant reassembly absorbing the off-by-one
    /// between segment counting at generation and at reception. Decoded
    /// packets are pushed to the outbound queue for forwarding. The inbound
    /// buffer is always cleared.
    pub fn decode(&mut self, now: Tick, segments_required: u64) -> Interrupt {
        let mut groups: HashMap<PacketId, Vec<Packet>> = HashMap::new();
        for fragment in self.inbound.drain(..) {
            if fragment.channel == self.channel && fragment.sf == self.sf {
                groups.entry(fragment.id.clone()).or_default().push(fragment);
            }
        }

        let lo = segments_required.saturating_sub(1);
        let hi = segments_required + 1;
        let mut decoded = false;
        // Deterministic order across the (rare) multi-packet decode.
        let mut ids: Vec<PacketId> = groups.keys().cloned().collect();
        ids.sort_by(|a, b| {
            (&a.source, &a.generation_time).cmp(&(&b.source, &b.generation_time))
        });

        for id in ids {
            let fragments = &groups[&id];
            let count = fragments.len() as u64;
            let strongest = fragments.iter().max_by(|a, b| {
                a.received_power
                    .partial_cmp(&b.received_power)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if let (true, Some(strongest)) = ((lo..=hi).contains(&count), strongest) {
                let mut packet = strongest.clone();
                packet.reception_time = Some(now);
                packet.segments_left = 0;
                debug!(device = %self.id, source = %packet.source, tick = now, "packet decoded");
                self.decoded_ids.insert(packet.id.clone());
                self.outbound.push_back(packet);
                decoded = true;
            } else {
                debug!(
                    device = %self.id,
                    fragments = count,
                    required = segments_required,
                    "reassembly failed"
                );
            }
        }

        if decoded {
            Interrupt::PacketDecoded
        } else {
            Interrupt::PacketNonDecoded
        }
    }

    /// Drop buffered fragments recorded under the *current* tuning. Used
    /// when an expected reply never completed, so stale partial fragments
    /// cannot corrupt the next reception.
    pub fn clear_interrupted_fragments(&mut self) {
        let (channel, sf) = (self.channel, self.sf);
        self.inbound.retain(|p| p.channel != channel || p.sf != sf);
    }

    fn buffer_fragment(&mut self, fragment: Packet) {
        // Retuning invalidates fragments recorded under another slot, and a
        // new first fragment interrupts any partially buffered packet.
        let (channel, sf) = (self.channel, self.sf);
        self.inbound.retain(|p| p.channel == channel && p.sf == sf);
        if fragment.first_fragment {
            let id = fragment.id.clone();
            self.inbound.retain(|p| p.id == id);
        }
        self.inbound.push(fragment);
    }
}

fn validate_tuning(channel: u8, sf: u8) -> Result<(), ConfigError> {
    if !(MIN_CHANNEL..=MAX_CHANNEL).contains(&channel) || !(MIN_SF..=MAX_SF).contains(&sf) {
        return Err(ConfigError::InvalidTuning { channel, sf });
    }
    Ok(())
}

// ============================================================================
// Wake-Up Radio Module
// ============================================================================

/// Ultra-low-power companion receiver: transmits tiny beacons and raises a
/// wake interrupt after a fixed decode latency when one is heard.
#[derive(Debug)]
pub struct WakeUpRadioModule {
    id: DeviceId,
    location: Location,
    params: WakeUpRadioParams,

    outbound: VecDeque<WakeUpBeacon>,
    irq: bool,
    latency_left: u64,
}

impl WakeUpRadioModule {
    /// Create a wake-up radio.
    pub fn new(id: DeviceId, params: WakeUpRadioParams, location: Location) -> Self {
        WakeUpRadioModule {
            id,
            location,
            params,
            outbound: VecDeque::new(),
            irq: false,
            latency_left: 0,
        }
    }

    /// Detection sensitivity in dBm.
    pub fn sensitivity(&self) -> f64 {
        self.params.sensitivity_dbm
    }

    /// Decode latency in ticks.
    pub fn latency_ms(&self) -> u64 {
        self.params.latency_ms
    }

    /// Whether a beacon is queued for transmission.
    pub fn has_pending_beacon(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Queue a beacon for transmission.
    pub fn generate_beacon(&mut self, now: Tick) {
        self.outbound.push_back(WakeUpBeacon {
            id: format!("{}-{}", self.id, now),
            generation_time: now,
        });
    }

    /// Pop the oldest queued beacon and wrap it for the medium.
    pub fn transmit_beacon(&mut self) -> Option<WakeUpSignal> {
        self.outbound.pop_front().map(|beacon| WakeUpSignal {
            beacon,
            tx_power_dbm: self.params.transmission_power_dbm,
            source_location: self.location,
            airtime: self.params.latency_ms,
        })
    }

    /// Scan the live beacons for one tick.
    ///
    /// A beacon above sensitivity whose remaining airtime matches the
    /// nominal latency (re)starts the latency countdown; the countdown
    /// reaching zero raises the wake interrupt.
    pub fn listen(&mut self, beacons: &[BeaconInFlight]) {
        for record in beacons {
            let d = phy::distance(&record.signal.source_location, &self.location);
            let rx = phy::received_power(
                d,
                record.signal.tx_power_dbm,
                phy::DEFAULT_SHADOWING_DB,
            );
            if rx >= self.params.sensitivity_dbm && record.toa_left == record.signal.airtime as i64
            {
                self.latency_left = self.params.latency_ms;
            }
        }

        if self.latency_left > 0 {
            self.latency_left -= 1;
            if self.latency_left == 0 {
                debug!(device = %self.id, "wake-up code matched");
                self.irq = true;
            }
        }
    }

    /// Consume the wake interrupt, if raised.
    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.irq)
    }
}

// ============================================================================
// Tests
// ============================================================================
