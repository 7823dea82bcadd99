//! Error types for the bridge core.

use thiserror::Error;

use crate::descriptor::StreamId;

/// SDP text could not be parsed into a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("malformed SDP line: {0:?}")]
    MalformedLine(String),

    #[error("unparsable number in SDP field: {0:?}")]
    BadNumber(String),

    #[error("required SDP field missing: {0}")]
    MissingField(&'static str),

    #[error("unsupported SDP version: {0}")]
    UnknownVersion(String),
}

/// A stream descriptor violates a structural constraint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("unknown audio encoding: {0:?}")]
    InvalidEncoding(String),

    #[error("unsupported sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("invalid channel count: {0} (must be 1..=128)")]
    InvalidChannelCount(u16),

    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("invalid TTL: {0}")]
    InvalidTtl(u8),

    #[error("connection address {0} is not in 239.0.0.0/8")]
    InvalidMulticast(String),

    #[error("ptime {ptime_ms} ms does not match framecount {framecount} at {sample_rate} Hz")]
    PtimeFramecountMismatch {
        ptime_ms: f64,
        framecount: u32,
        sample_rate: u32,
    },

    #[error("invalid PTP domain: {0} (must be -1 or 0..=127)")]
    InvalidPtpDomain(i16),
}

/// A channel mapping cannot be admitted or updated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping touches device channels outside 0..128")]
    OutOfRange,

    #[error("mapping overlaps {} existing stream(s)", .0.len())]
    Overlap(Vec<StreamId>),

    #[error("a mapping for this stream already exists")]
    Duplicate,

    #[error("mapping covers zero channels")]
    EmptyChannelCount,
}

/// A stream failed the manager's admission rules.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    #[error("stream sample rate {got} Hz does not match device rate {expected} Hz")]
    SampleRateMismatch { expected: f64, got: u32 },

    #[error("stream needs {needed} device channels but only {available} are free")]
    InsufficientChannels { needed: u16, available: u16 },

    #[error("another stream already uses this multicast endpoint in the same direction")]
    EndpointConflict,

    #[error("encoding {0:?} has no codec")]
    UnsupportedEncoding(crate::descriptor::AudioEncoding),
}

/// Socket-level failures surfaced when starting or driving a stream.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind socket: {0}")]
    SocketBindFailed(std::io::Error),

    #[error("failed to join multicast group: {0}")]
    MulticastJoinFailed(std::io::Error),

    #[error("send failed: {0}")]
    SendFailed(std::io::Error),

    #[error("receive failed: {0}")]
    RecvFailed(std::io::Error),
}

/// Stream lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("no such stream")]
    NotFound,

    #[error("stream is already stopped")]
    AlreadyStopped,
}

/// Persisted-state errors.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("config I/O failed: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("config document could not be decoded: {0}")]
    DecodeFailed(String),
}

/// Top-level error for all public bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Sdp(#[from] SdpError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = AdmissionError::InsufficientChannels {
            needed: 8,
            available: 0,
        };
        assert!(err.to_string().contains("8"));
        assert!(err.to_string().contains("0"));

        let err = DescriptorError::InvalidMulticast("224.1.2.3".into());
        assert!(err.to_string().contains("224.1.2.3"));
    }

    #[test]
    fn bridge_error_wraps_families() {
        let err: BridgeError = StreamError::NotFound.into();
        assert!(matches!(err, BridgeError::Stream(StreamError::NotFound)));

        let err: BridgeError = MappingError::Duplicate.into();
        assert!(matches!(err, BridgeError::Mapping(MappingError::Duplicate)));
    }
}
