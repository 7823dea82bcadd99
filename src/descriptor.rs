//! Stream identity and the immutable stream descriptor.
//!
//! A descriptor captures what an SDP session defines: network endpoint,
//! audio format, packet timing and PTP binding. Once a stream is admitted
//! the descriptor never changes; channel-count or rate changes require
//! removing and re-adding the stream.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DescriptorError;

/// Sample rates a descriptor may declare.
pub const VALID_SAMPLE_RATES: [u32; 8] = [
    44_100, 48_000, 88_200, 96_000, 176_400, 192_000, 352_800, 384_000,
];

/// Opaque 128-bit stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The distinguished null identifier.
    pub fn null() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Audio payload encoding.
///
/// `Am824` is accepted by SDP and descriptor validation but no codec exists
/// for it; admission rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    L16,
    L24,
    Am824,
}

impl AudioEncoding {
    /// Bytes per sample on the wire.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::L16 => 2,
            Self::L24 => 3,
            Self::Am824 => 4,
        }
    }

    /// The encoding name used in `a=rtpmap`.
    pub fn rtpmap_name(&self) -> &'static str {
        match self {
            Self::L16 => "L16",
            Self::L24 => "L24",
            Self::Am824 => "AM824",
        }
    }

    /// Parse an `a=rtpmap` encoding name.
    pub fn from_rtpmap_name(name: &str) -> Option<Self> {
        match name {
            "L16" => Some(Self::L16),
            "L24" => Some(Self::L24),
            "AM824" => Some(Self::Am824),
            _ => None,
        }
    }

    /// Whether a codec exists for this encoding.
    pub fn has_codec(&self) -> bool {
        !matches!(self, Self::Am824)
    }
}

/// Which way audio flows relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// We transmit onto the network.
    SendOnly,
    /// We receive from the network.
    RecvOnly,
}

impl Direction {
    /// SDP direction attribute name.
    pub fn sdp_attribute(&self) -> &'static str {
        match self {
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
        }
    }
}

/// Immutable description of one AES67 stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub session_name: String,
    pub session_info: Option<String>,
    /// Address from the SDP origin (`o=`) line.
    pub origin_address: String,

    /// Multicast group the stream lives on. Must be in 239.0.0.0/8.
    pub connection_address: Ipv4Addr,
    pub port: u16,
    pub ttl: u8,
    /// Source address from `a=source-filter`, if any.
    pub source_filter: Option<Ipv4Addr>,

    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub num_channels: u16,
    pub payload_type: u8,

    /// Packet time in milliseconds. May be fractional (e.g. 0.125).
    pub ptime_ms: f64,
    /// Samples per channel per packet. Must equal `sample_rate * ptime_ms / 1000`.
    pub framecount: u32,

    /// PTP domain, or -1 for the local clock.
    pub ptp_domain: i16,
    /// Grandmaster identity string from `a=ts-refclk`, if any.
    pub master_clock_id: Option<String>,
    /// Media clock reference from `a=mediaclk`, if any (e.g. `direct=0`).
    pub media_clock: Option<String>,

    pub direction: Direction,

    /// Unrecognized `a=` attributes, retained verbatim in insertion order
    /// so foreign sessions survive a parse/generate round trip.
    #[serde(default)]
    pub extra_attributes: Vec<(String, Option<String>)>,
}

impl Default for StreamDescriptor {
    fn default() -> Self {
        Self {
            session_name: String::new(),
            session_info: None,
            origin_address: "0.0.0.0".to_string(),
            connection_address: Ipv4Addr::new(239, 192, 76, 52),
            port: 5004,
            ttl: 8,
            source_filter: None,
            encoding: AudioEncoding::L24,
            sample_rate: 48_000,
            num_channels: 2,
            payload_type: 96,
            ptime_ms: 1.0,
            framecount: 48,
            ptp_domain: 0,
            master_clock_id: None,
            media_clock: Some("direct=0".to_string()),
            direction: Direction::RecvOnly,
            extra_attributes: Vec::new(),
        }
    }
}

impl StreamDescriptor {
    /// Check every structural constraint, reporting the first violation.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !VALID_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(DescriptorError::InvalidSampleRate(self.sample_rate));
        }
        if self.num_channels == 0 || self.num_channels > crate::DEVICE_CHANNELS as u16 {
            return Err(DescriptorError::InvalidChannelCount(self.num_channels));
        }
        if self.port == 0 {
            return Err(DescriptorError::InvalidPort(self.port));
        }
        if self.connection_address.octets()[0] != 239 {
            return Err(DescriptorError::InvalidMulticast(
                self.connection_address.to_string(),
            ));
        }
        if !(96..=127).contains(&self.payload_type) {
            return Err(DescriptorError::InvalidEncoding(format!(
                "payload type {}",
                self.payload_type
            )));
        }
        if self.ttl == 0 {
            return Err(DescriptorError::InvalidTtl(self.ttl));
        }
        if !(-1..=127).contains(&self.ptp_domain) {
            return Err(DescriptorError::InvalidPtpDomain(self.ptp_domain));
        }
        let expected = self.sample_rate as f64 * self.ptime_ms / 1000.0;
        if self.ptime_ms <= 0.0 || (expected - self.framecount as f64).abs() > 1e-6 {
            return Err(DescriptorError::PtimeFramecountMismatch {
                ptime_ms: self.ptime_ms,
                framecount: self.framecount,
                sample_rate: self.sample_rate,
            });
        }
        Ok(())
    }

    /// True iff every constraint holds.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Payload bytes per packet.
    pub fn payload_bytes(&self) -> usize {
        self.framecount as usize * self.num_channels as usize * self.encoding.bytes_per_sample()
    }

    /// Packet interval in nanoseconds.
    pub fn packet_interval_ns(&self) -> u64 {
        (self.framecount as u64 * 1_000_000_000) / self.sample_rate as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> StreamDescriptor {
        StreamDescriptor {
            session_name: "Console Feed".into(),
            connection_address: Ipv4Addr::new(239, 1, 1, 1),
            num_channels: 8,
            ..Default::default()
        }
    }

    #[test]
    fn default_shape_is_valid() {
        assert!(valid().is_valid());
    }

    #[test]
    fn rejects_non_multicast() {
        let mut d = valid();
        d.connection_address = Ipv4Addr::new(224, 0, 1, 129);
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::InvalidMulticast(_))
        ));
    }

    #[test]
    fn rejects_bad_rate_and_channels() {
        let mut d = valid();
        d.sample_rate = 22_050;
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::InvalidSampleRate(22_050))
        ));

        let mut d = valid();
        d.num_channels = 0;
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::InvalidChannelCount(0))
        ));
        d.num_channels = 129;
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::InvalidChannelCount(129))
        ));
    }

    #[test]
    fn ptime_framecount_must_agree() {
        let mut d = valid();
        d.framecount = 47;
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::PtimeFramecountMismatch { .. })
        ));

        // 0.125 ms at 48 kHz is exactly 6 frames.
        let mut d = valid();
        d.ptime_ms = 0.125;
        d.framecount = 6;
        assert!(d.is_valid());
    }

    #[test]
    fn ptp_domain_range() {
        let mut d = valid();
        d.ptp_domain = -1;
        assert!(d.is_valid());
        d.ptp_domain = 127;
        assert!(d.is_valid());
        d.ptp_domain = 128;
        assert!(matches!(
            d.validate(),
            Err(DescriptorError::InvalidPtpDomain(128))
        ));
    }

    #[test]
    fn derived_packet_quantities() {
        let d = valid();
        // 48 frames * 8 channels * 3 bytes.
        assert_eq!(d.payload_bytes(), 1152);
        assert_eq!(d.packet_interval_ns(), 1_000_000);
    }

    #[test]
    fn null_stream_id() {
        assert!(StreamId::null().is_null());
        assert!(!StreamId::generate().is_null());
        assert_ne!(StreamId::generate(), StreamId::generate());
    }
}
