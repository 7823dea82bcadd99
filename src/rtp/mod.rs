//! RTP wire format: RFC 3550 header handling and audio payload codecs.

pub mod codec;
pub mod header;

pub use codec::{
    decode_dop, decode_l16, decode_l24, dsd_rate_for_container, encode_dop, encode_l16,
    encode_l24, DopDetector, DOP_MARKER_A, DOP_MARKER_B,
};
pub use header::{sequence_diff, PacketBuilder, RtpHeader, RtpPacket, RTP_HEADER_LEN};
