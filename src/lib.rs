//! aes67-bridge
//!
//! Core of a host-resident virtual audio endpoint that bridges a local
//! realtime audio subsystem to AES67-compatible RTP streams. Applications
//! see one 128-channel bidirectional device; on the network the device is a
//! set of multicast RTP senders and receivers described by SDP sessions and
//! disciplined by a PTPv2 clock per domain (with local-clock fallback).
//!
//! The crate is the data plane and stream control plane only. The host
//! audio shell, management UI, discovery helpers and the on-disk location
//! of persisted state are external collaborators; see `device`, `clock`
//! and `persist` for the seams they plug into.

pub mod audio_io;
pub mod clock;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod input;
pub mod manager;
pub mod mapping;
pub mod output;
pub mod persist;
pub mod ring;
pub mod rtp;
pub mod sdp;

/// Device width in channels, each direction.
pub const DEVICE_CHANNELS: usize = 128;

/// Largest host callback the realtime path handles in one scratch pass;
/// larger callbacks are processed in chunks of this many frames.
pub const MAX_CALLBACK_FRAMES: usize = 512;

/// Ring headroom in milliseconds of audio per device channel.
pub const RING_SAFETY_MS: f64 = 2.0;

/// Multicast TTL used when a session does not specify one.
pub const DEFAULT_TTL: u8 = 8;

pub use audio_io::{AudioIoHandler, CallbackStatus, IoStats};
pub use clock::{ClockHandle, ClockSource, LocalClock, PtpHelper};
pub use descriptor::{AudioEncoding, Direction, StreamDescriptor, StreamId};
pub use device::VirtualDevice;
pub use error::{
    AdmissionError, BridgeError, DescriptorError, MappingError, PersistError, Result, SdpError,
    StreamError, TransportError,
};
pub use manager::{ManagerConfig, ReceiverTuning, StreamEvent, StreamInfo, StreamManager};
pub use mapping::{ChannelMap, ChannelMapping};
pub use ring::{Ring, RingFabric};
