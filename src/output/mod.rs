//! Outbound stream handling: ring drain, interleave, encode and paced
//! multicast transmission.

pub mod stream;

pub use stream::{RtpTransmitter, TxStatsSnapshot};
