//! Inbound stream handling: UDP multicast reception, RTP validation and
//! decode, fan-out into the input rings.

pub mod stream;

pub use stream::{ReceiverTuning, RtpReceiver, RxStatsSnapshot};
