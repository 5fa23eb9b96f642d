//! Decoder for 32-channel spinning LIDAR datagrams.
//!
//! A sensor datagram is a 42-byte Ethernet/IPv4/UDP header followed by a
//! 1206-byte payload. The payload holds 12 firing blocks of 100 bytes:
//!
//! | offset | size | content                                   |
//! |--------|------|-------------------------------------------|
//! | 0      | 2    | block flag                                |
//! | 2      | 2    | azimuth, little-endian, hundredths of a ° |
//! | 4      | 96   | 32 × (u16 LE range in 2 mm, u8 intensity) |
//!
//! The trailing 6 bytes (timestamp + factory bytes) are not used.

/// Number of laser channels.
pub const LASERS: usize = 32;

/// Number of firing blocks per datagram.
pub const BLOCKS: usize = 12;

/// Length of the transport header preceding the payload.
pub const HEADER_LEN: usize = 42;

/// Length of the sensor payload.
pub const PAYLOAD_LEN: usize = 1206;

/// Total datagram length as captured on the wire.
pub const DATAGRAM_LEN: usize = HEADER_LEN + PAYLOAD_LEN;

/// UDP destination port the sensor streams data to.
pub const SENSOR_PORT: u16 = 2368;

const BLOCK_LEN: usize = 100;
const CHANNEL_LEN: usize = 3;
const RANGE_UNIT_M: f32 = 0.002;

/// Elevation angle (degrees) of each laser channel, indexed by channel id.
pub const ELEVATION_LUT: [f32; LASERS] = [
    -30.67, -9.33, -29.33, -8.00, -28.00, -6.66, -26.66, -5.33, -25.33, -4.00, -24.00, -2.67,
    -22.67, -1.33, -21.33, 0.00, -20.00, 1.33, -18.67, 2.67, -17.33, 4.00, -16.00, 5.33, -14.67,
    6.67, -13.33, 8.00, -12.00, 9.33, -10.67, 10.67,
];

/// One azimuth-tagged set of returns across all channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    /// Azimuth in hundredths of a degree, shared by all channels.
    pub azimuth_raw: u16,
    /// Range per channel in meters (0.0 means no return).
    pub ranges_m: [f32; LASERS],
    /// Intensity per channel.
    pub intensities: [u8; LASERS],
}

impl Firing {
    /// Azimuth in degrees.
    #[inline]
    pub fn azimuth_deg(&self) -> f32 {
        self.azimuth_raw as f32 / 100.0
    }
}

/// Read the UDP destination port from a raw datagram.
#[inline]
fn destination_port(datagram: &[u8]) -> u16 {
    u16::from_be_bytes([datagram[36], datagram[37]])
}

/// Check a raw datagram against the sensor signature (length and port).
pub fn is_sensor_datagram(datagram: &[u8]) -> bool {
    datagram.len() == DATAGRAM_LEN && destination_port(datagram) == SENSOR_PORT
}

/// A validated sensor payload.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse a full datagram, returning `None` when it does not match the
    /// sensor signature.
    pub fn parse(datagram: &'a [u8]) -> Option<Self> {
        if !is_sensor_datagram(datagram) {
            return None;
        }
        Some(Self {
            payload: &datagram[HEADER_LEN..],
        })
    }

    /// Wrap a bare payload (transport header already stripped).
    pub fn from_payload(payload: &'a [u8]) -> Option<Self> {
        if payload.len() != PAYLOAD_LEN {
            return None;
        }
        Some(Self { payload })
    }

    /// Raw azimuth of a block in hundredths of a degree.
    #[inline]
    pub fn block_azimuth(&self, block: usize) -> u16 {
        let offset = block * BLOCK_LEN + 2;
        u16::from_le_bytes([self.payload[offset], self.payload[offset + 1]])
    }

    /// Decode a single firing block.
    pub fn firing(&self, block: usize) -> Firing {
        let base = block * BLOCK_LEN + 4;
        let mut ranges_m = [0.0f32; LASERS];
        let mut intensities = [0u8; LASERS];

        for channel in 0..LASERS {
            let offset = base + channel * CHANNEL_LEN;
            let raw = u16::from_le_bytes([self.payload[offset], self.payload[offset + 1]]);
            ranges_m[channel] = raw as f32 * RANGE_UNIT_M;
            intensities[channel] = self.payload[offset + 2];
        }

        Firing {
            azimuth_raw: self.block_azimuth(block),
            ranges_m,
            intensities,
        }
    }

    /// Lazily decode the 12 firings of this packet in block order.
    pub fn firings(self) -> impl Iterator<Item = Firing> + 'a {
        (0..BLOCKS).map(move |block| self.firing(block))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a datagram whose blocks carry the given azimuths. Every channel
    /// reports `range_raw` (2 mm units) and an intensity equal to its index.
    pub fn datagram(azimuths: [u16; BLOCKS], range_raw: u16) -> Vec<u8> {
        let mut buf = vec![0u8; DATAGRAM_LEN];
        buf[36..38].copy_from_slice(&SENSOR_PORT.to_be_bytes());

        for (block, azimuth) in azimuths.iter().enumerate() {
            let base = HEADER_LEN + block * BLOCK_LEN;
            buf[base] = 0xFF;
            buf[base + 1] = 0xEE;
            buf[base + 2..base + 4].copy_from_slice(&azimuth.to_le_bytes());
            for channel in 0..LASERS {
                let offset = base + 4 + channel * CHANNEL_LEN;
                buf[offset..offset + 2].copy_from_slice(&range_raw.to_le_bytes());
                buf[offset + 2] = channel as u8;
            }
        }
        buf
    }

    /// Azimuths for a datagram starting at `start` with a fixed step, wrapping
    /// at 360°.
    pub fn sweep(start: u16, step: u16) -> [u16; BLOCKS] {
        let mut out = [0u16; BLOCKS];
        for (i, az) in out.iter_mut().enumerate() {
            *az = ((start as u32 + i as u32 * step as u32) % 36000) as u16;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_decode_firings() {
        let buf = datagram(sweep(100, 20), 5000);
        let packet = Packet::parse(&buf).expect("valid datagram");
        let firings: Vec<Firing> = packet.firings().collect();

        assert_eq!(firings.len(), BLOCKS);
        assert_eq!(firings[0].azimuth_raw, 100);
        assert_eq!(firings[11].azimuth_raw, 100 + 11 * 20);
        assert!((firings[0].azimuth_deg() - 1.0).abs() < 1e-6);
        assert!((firings[3].ranges_m[7] - 10.0).abs() < 1e-4);
        assert_eq!(firings[3].intensities[7], 7);
    }

    #[test]
    fn test_reject_wrong_length() {
        let mut buf = datagram(sweep(0, 20), 100);
        buf.pop();
        assert!(Packet::parse(&buf).is_none());
    }

    #[test]
    fn test_reject_wrong_port() {
        let mut buf = datagram(sweep(0, 20), 100);
        buf[36..38].copy_from_slice(&2369u16.to_be_bytes());
        assert!(!is_sensor_datagram(&buf));
        assert!(Packet::parse(&buf).is_none());
    }

    #[test]
    fn test_from_payload() {
        let buf = datagram(sweep(35990, 20), 1);
        let packet = Packet::from_payload(&buf[HEADER_LEN..]).unwrap();
        assert_eq!(packet.block_azimuth(0), 35990);
        assert_eq!(packet.block_azimuth(1), 10);
        assert!(Packet::from_payload(&buf[..100]).is_none());
    }
}
