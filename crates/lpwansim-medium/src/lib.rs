//! # lpwansim-medium
//!
//! The shared wireless medium: every transmission in the simulated world
//! passes through a single [`Medium`].
//!
//! LoRa signals live in a channel-by-spreading-factor bucket grid so that
//! receivers only ever contend with transmissions on their own tuning.
//! Wake-up beacons are narrowband out-of-band signals and live in a flat
//! list.
//!
//! LoRa fragment records are transient: the transmitter re-inserts one
//! fragment per tick for the whole airtime, and [`Medium::tick`] clears the
//! grid at the end of each tick. Beacon records persist and count down
//! until their airtime is exhausted.

use lpwansim_radio::{
    BeaconInFlight, InFlight, WakeUpSignal, WirelessSignal, MAX_CHANNEL, MAX_SF, MIN_CHANNEL,
    MIN_SF,
};
use thiserror::Error;
use tracing::trace;

/// Number of channel rows in the bucket grid.
pub const CHANNEL_COUNT: usize = (MAX_CHANNEL - MIN_CHANNEL + 1) as usize;
/// Number of spreading factor columns in the bucket grid.
pub const SF_COUNT: usize = (MAX_SF - MIN_SF + 1) as usize;

/// Errors raised by medium operations.
#[derive(Debug, Error)]
pub enum MediumError {
    /// A signal carried a tuning outside the bucket grid.
    #[error("signal tuning out of range: channel {channel}, SF {sf}")]
    OutOfRange {
        /// Offending channel.
        channel: u8,
        /// Offending spreading factor.
        sf: u8,
    },
}

/// The shared medium all radios transmit into and sample from.
#[derive(Debug, Default)]
pub struct Medium {
    buckets: Vec<Vec<Vec<InFlight>>>,
    beacons: Vec<BeaconInFlight>,
}

impl Medium {
    /// Create an empty medium.
    pub fn new() -> Self {
        Medium {
            buckets: vec![vec![Vec::new(); SF_COUNT]; CHANNEL_COUNT],
            beacons: Vec::new(),
        }
    }

    /// Insert one LoRa fragment into the bucket matching its tuning.
    ///
    /// The remaining-airtime countdown is `segments_left - 1`: the final
    /// fragment of a packet is visible with zero ticks left, which is what
    /// receivers key their decode on.
    pub fn insert(&mut self, signal: WirelessSignal) -> Result<(), MediumError> {
        let (ch, sf) = bucket_index(signal.channel, signal.sf)?;
        let toa_left = signal.packet.segments_left as i64 - 1;
        trace!(
            source = %signal.packet.source,
            channel = signal.channel,
            sf = signal.sf,
            toa_left,
            "fragment on air"
        );
        self.buckets[ch][sf].push(InFlight { signal, toa_left });
        Ok(())
    }

    /// Insert a wake-up beacon. Its record persists for the full airtime.
    pub fn insert_beacon(&mut self, signal: WakeUpSignal) {
        let toa_left = signal.airtime as i64;
        trace!(beacon = %signal.beacon.id, toa_left, "beacon on air");
        self.beacons.push(BeaconInFlight { signal, toa_left });
    }

    /// The fragments currently in flight on one (channel, SF) slot.
    pub fn bucket(&self, channel: u8, sf: u8) -> Result<&[InFlight], MediumError> {
        let (ch, sf) = bucket_index(channel, sf)?;
        Ok(&self.buckets[ch][sf])
    }

    /// The wake-up beacons currently in flight.
    pub fn beacons(&self) -> &[BeaconInFlight] {
        &self.beacons
    }

    /// Every (channel, SF) slot with at least one fragment in flight, in
    /// ascending order. Gateways use this to retune their parallel
    /// demodulation paths deterministically.
    pub fn occupied(&self) -> Vec<(u8, u8)> {
        let mut slots = Vec::new();
        for (ch, row) in self.buckets.iter().enumerate() {
            for (sf, bucket) in row.iter().enumerate() {
                if !bucket.is_empty() {
                    slots.push((ch as u8 + MIN_CHANNEL, sf as u8 + MIN_SF));
                }
            }
        }
        slots
    }

    /// Remaining-airtime view of every fragment in flight, for diagnostics
    /// and tests.
    pub fn snapshot(&self) -> Vec<(u8, u8, i64)> {
        let mut entries = Vec::new();
        for (ch, row) in self.buckets.iter().enumerate() {
            for (sf, bucket) in row.iter().enumerate() {
                for record in bucket {
                    entries.push((ch as u8 + MIN_CHANNEL, sf as u8 + MIN_SF, record.toa_left));
                }
            }
        }
        entries
    }

    /// Advance the medium by one tick.
    ///
    /// All LoRa fragments are consumed: a transmission that continues must
    /// re-insert its next fragment on the next tick. Beacons count down and
    /// drop once their airtime is exhausted.
    pub fn tick(&mut self) {
        for row in &mut self.buckets {
            for bucket in row {
                bucket.clear();
            }
        }
        for beacon in &mut self.beacons {
            beacon.toa_left -= 1;
        }
        self.beacons.retain(|b| b.toa_left >= 0);
    }
}

fn bucket_index(channel: u8, sf: u8) -> Result<(usize, usize), MediumError> {
    if !(MIN_CHANNEL..=MAX_CHANNEL).contains(&channel) || !(MIN_SF..=MAX_SF).contains(&sf) {
        return Err(MediumError::OutOfRange { channel, sf });
    }
    Ok(((channel - MIN_CHANNEL) as usize, (sf - MIN_SF) as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpwansim_phy::Location;
    use lpwansim_radio::{
        Destination, DeviceId, Packet, PacketId, Payload, WakeUpBeacon,
    };

    fn signal(channel: u8, sf: u8, segments_left: u64) -> WirelessSignal {
        let source = DeviceId::new("n1");
        let id = PacketId {
            source: source.clone(),
            destination: Destination::Broadcast,
            generation_time: 0,
        };
        WirelessSignal {
            packet: Packet {
                id,
                source: source.clone(),
                destination: Destination::Broadcast,
                generation_time: 0,
                payload: Payload::Data { message: "x".into() },
                segments_required: segments_left,
                segments_left,
                first_fragment: true,
                channel,
                sf,
                reception_time: None,
                received_power: None,
            },
            channel,
            sf,
            bandwidth_khz: 125,
            tx_power_dbm: 14.0,
            source_location: Location::new(0.0, 0.0),
        }
    }

    #[test]
    fn test_bucket_isolation() {
        let mut medium = Medium::new();
        medium.insert(signal(1, 7, 1)).unwrap();
        medium.insert(signal(9, 12, 1)).unwrap();
        assert_eq!(medium.bucket(1, 7).unwrap().len(), 1);
        assert_eq!(medium.bucket(9, 12).unwrap().len(), 1);
        assert!(medium.bucket(1, 8).unwrap().is_empty());
        assert!(medium.bucket(2, 7).unwrap().is_empty());
    }

    #[test]
    fn test_insert_out_of_range() {
        let mut medium = Medium::new();
        assert!(matches!(
            medium.insert(signal(0, 7, 1)),
            Err(MediumError::OutOfRange { channel: 0, sf: 7 })
        ));
        assert!(medium.insert(signal(1, 13, 1)).is_err());
        assert!(medium.bucket(10, 7).is_err());
    }

    #[test]
    fn test_final_fragment_has_zero_toa_left() {
        let mut medium = Medium::new();
        medium.insert(signal(1, 7, 3)).unwrap();
        medium.insert(signal(1, 7, 1)).unwrap();
        let bucket = medium.bucket(1, 7).unwrap();
        assert_eq!(bucket[0].toa_left, 2);
        assert_eq!(bucket[1].toa_left, 0);
        assert_eq!(medium.snapshot(), vec![(1, 7, 2), (1, 7, 0)]);
    }

    #[test]
    fn test_fragments_cleared_each_tick() {
        let mut medium = Medium::new();
        medium.insert(signal(1, 7, 5)).unwrap();
        medium.tick();
        assert!(medium.bucket(1, 7).unwrap().is_empty());
        assert!(medium.occupied().is_empty());
    }

    #[test]
    fn test_occupied_sorted() {
        let mut medium = Medium::new();
        medium.insert(signal(5, 9, 1)).unwrap();
        medium.insert(signal(1, 12, 1)).unwrap();
        medium.insert(signal(1, 7, 1)).unwrap();
        assert_eq!(medium.occupied(), vec![(1, 7), (1, 12), (5, 9)]);
    }

    #[test]
    fn test_beacon_expiry() {
        let mut medium = Medium::new();
        medium.insert_beacon(WakeUpSignal {
            beacon: WakeUpBeacon { id: "n1-0".into(), generation_time: 0 },
            tx_power_dbm: 14.0,
            source_location: Location::new(0.0, 0.0),
            airtime: 2,
        });
        // Visible for airtime + 1 ticks (toa_left 2, 1, 0), gone after.
        for _ in 0..3 {
            assert_eq!(medium.beacons().len(), 1);
            medium.tick();
        }
        assert!(medium.beacons().is_empty());
    }
}
