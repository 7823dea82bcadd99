//! RTP receiver: one worker thread per inbound stream.
//!
//! The worker blocks on a short socket timeout so cancellation is observed
//! within one tick. Packet handling lives in `RxEngine`, which owns no
//! socket; the worker just feeds it datagrams.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::clock::{ClockHandle, ClockSource};
use crate::descriptor::{AudioEncoding, StreamDescriptor};
use crate::error::TransportError;
use crate::mapping::MappingSlot;
use crate::ring::RingFabric;
use crate::rtp::{decode_l16, decode_l24, dsd_rate_for_container, DopDetector, RtpPacket};

/// Receive-side policy knobs. Defaults are conservative; all three are
/// deployment-tunable.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverTuning {
    /// Forward sequence gap (packets) still accepted as loss.
    pub forward_window: u16,
    /// Backward sequence distance treated as a late reordered packet.
    pub reorder_window: u16,
    /// Silence interval after which `is_connected` drops.
    pub connection_timeout_ms: u64,
}

impl Default for ReceiverTuning {
    fn default() -> Self {
        Self {
            forward_window: 16,
            reorder_window: 16,
            connection_timeout_ms: 500,
        }
    }
}

/// Receiver statistics, updated with relaxed atomics from the worker.
#[derive(Default)]
pub(crate) struct RxStats {
    pub packets_received: AtomicU64,
    pub packets_lost: AtomicU64,
    pub bytes_received: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub reordered_packets: AtomicU64,
    pub resyncs: AtomicU64,
    /// Samples that found no ring space.
    pub drops: AtomicU64,
    pub last_packet_ns: AtomicU64,
    pub connected: AtomicBool,
    pub dop_stream: AtomicBool,
    /// Frames per packet observed on the wire.
    pub detected_framecount: AtomicU64,
}

/// Plain-value snapshot for status reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxStatsSnapshot {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_received: u64,
    pub malformed_packets: u64,
    pub reordered_packets: u64,
    pub resyncs: u64,
    pub drops: u64,
    pub is_connected: bool,
    pub dop_stream: bool,
    pub detected_framecount: u64,
}

impl RxStats {
    fn snapshot(&self) -> RxStatsSnapshot {
        RxStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            reordered_packets: self.reordered_packets.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            is_connected: self.connected.load(Ordering::Relaxed),
            dop_stream: self.dop_stream.load(Ordering::Relaxed),
            detected_framecount: self.detected_framecount.load(Ordering::Relaxed),
        }
    }
}

/// What to do with an observed sequence number.
#[derive(Debug, PartialEq, Eq)]
enum SeqDecision {
    Accept { lost: u32 },
    DropReorder,
    Resync,
}

/// Expected-sequence tracker with wrap-aware windows.
struct SequenceTracker {
    next: Option<u16>,
    forward_window: i32,
    reorder_window: i32,
}

impl SequenceTracker {
    fn new(tuning: &ReceiverTuning) -> Self {
        Self {
            next: None,
            forward_window: tuning.forward_window as i32,
            reorder_window: tuning.reorder_window as i32,
        }
    }

    fn observe(&mut self, seq: u16) -> SeqDecision {
        let expected = match self.next {
            None => {
                self.next = Some(seq.wrapping_add(1));
                return SeqDecision::Accept { lost: 0 };
            }
            Some(e) => e,
        };

        let diff = crate::rtp::sequence_diff(expected, seq);
        if diff == 0 {
            self.next = Some(seq.wrapping_add(1));
            SeqDecision::Accept { lost: 0 }
        } else if diff > 0 && diff <= self.forward_window {
            self.next = Some(seq.wrapping_add(1));
            SeqDecision::Accept { lost: diff as u32 }
        } else if diff < 0 && -diff <= self.reorder_window {
            SeqDecision::DropReorder
        } else {
            self.next = Some(seq.wrapping_add(1));
            SeqDecision::Resync
        }
    }
}

/// Socket-free packet pipeline: validate, track sequence, decode,
/// de-interleave into the input rings through the mapping snapshot.
pub(crate) struct RxEngine {
    descriptor: StreamDescriptor,
    fabric: Arc<RingFabric>,
    clock: ClockHandle,
    stats: Arc<RxStats>,
    mapping_slot: Arc<MappingSlot>,
    mapping: Arc<crate::mapping::ChannelMapping>,
    mapping_epoch: u64,
    tracker: SequenceTracker,
    tuning: ReceiverTuning,
    dop: DopDetector,
    /// Interleaved decode scratch, `framecount * channels` at nominal size.
    interleaved: Vec<f32>,
    /// One channel's column, written to its ring in a single batch.
    column: Vec<f32>,
}

impl RxEngine {
    pub(crate) fn new(
        descriptor: StreamDescriptor,
        mapping_slot: Arc<MappingSlot>,
        fabric: Arc<RingFabric>,
        clock: ClockHandle,
        stats: Arc<RxStats>,
        tuning: ReceiverTuning,
    ) -> Self {
        let nominal =
            descriptor.framecount as usize * descriptor.num_channels as usize;
        let mapping = mapping_slot.load();
        let mapping_epoch = mapping_slot.epoch();
        Self {
            tracker: SequenceTracker::new(&tuning),
            interleaved: vec![0.0; nominal.max(1)],
            column: vec![0.0; descriptor.framecount.max(1) as usize],
            descriptor,
            fabric,
            clock,
            stats,
            mapping_slot,
            mapping,
            mapping_epoch,
            tuning,
            dop: DopDetector::new(),
        }
    }

    /// Process one datagram.
    pub(crate) fn handle_datagram(&mut self, data: &[u8], source: Option<Ipv4Addr>) {
        if let (Some(filter), Some(src)) = (self.descriptor.source_filter, source) {
            if src != filter {
                return;
            }
        }

        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let packet = match RtpPacket::parse(data) {
            Some(p) => p,
            None => {
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if packet.header.payload_type != self.descriptor.payload_type {
            self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let channels = self.descriptor.num_channels as usize;
        let bytes_per_sample = self.descriptor.encoding.bytes_per_sample();
        let frame_bytes = channels * bytes_per_sample;
        if frame_bytes == 0 || packet.payload.len() % frame_bytes != 0 {
            self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let frames = packet.payload.len() / frame_bytes;

        match self.tracker.observe(packet.header.sequence) {
            SeqDecision::Accept { lost } => {
                if lost > 0 {
                    self.stats
                        .packets_lost
                        .fetch_add(lost as u64, Ordering::Relaxed);
                }
            }
            SeqDecision::DropReorder => {
                self.stats.reordered_packets.fetch_add(1, Ordering::Relaxed);
                return;
            }
            SeqDecision::Resync => {
                self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .detected_framecount
            .store(frames as u64, Ordering::Relaxed);

        let total = frames * channels;
        if self.interleaved.len() < total {
            self.interleaved.resize(total, 0.0);
        }
        if self.column.len() < frames {
            self.column.resize(frames, 0.0);
        }

        match self.descriptor.encoding {
            AudioEncoding::L16 => {
                decode_l16(packet.payload, &mut self.interleaved[..total]);
            }
            AudioEncoding::L24 => {
                decode_l24(packet.payload, &mut self.interleaved[..total]);
                if dsd_rate_for_container(self.descriptor.sample_rate).is_some()
                    && self.dop.feed(packet.payload, channels)
                {
                    self.stats.dop_stream.store(true, Ordering::Relaxed);
                }
            }
            // Admission refuses AM824 descriptors; nothing to decode.
            AudioEncoding::Am824 => {
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        self.fan_out(frames, channels);

        self.stats
            .last_packet_ns
            .store(self.clock.now_ns(), Ordering::Relaxed);
        self.stats.connected.store(true, Ordering::Relaxed);
    }

    /// Write each mapped channel's column into its ring. All rings of the
    /// stream advance by the same amount so channels stay frame-aligned.
    fn fan_out(&mut self, frames: usize, channels: usize) {
        if self.mapping_slot.epoch() != self.mapping_epoch {
            self.mapping = self.mapping_slot.load();
            self.mapping_epoch = self.mapping_slot.epoch();
        }
        let mapping = &self.mapping;

        let offset = mapping.stream_channel_offset as usize;
        let count = mapping.stream_channel_count as usize;

        let mut writable = frames;
        for s in 0..count {
            if let Some(device) = mapping.device_channel_for(s as u16) {
                writable = writable.min(self.fabric.input(device as usize).writable());
            }
        }

        if writable < frames {
            let dropped = (frames - writable) * count;
            self.stats.drops.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        if writable == 0 {
            return;
        }

        for s in 0..count {
            let stream_channel = offset + s;
            if stream_channel >= channels {
                break;
            }
            let Some(device) = mapping.device_channel_for(s as u16) else {
                continue;
            };
            for f in 0..writable {
                self.column[f] = self.interleaved[f * channels + stream_channel];
            }
            self.fabric
                .input(device as usize)
                .write(&self.column[..writable]);
        }
    }

    /// Periodic housekeeping between datagrams: connection timeout.
    pub(crate) fn tick(&mut self) {
        let last = self.stats.last_packet_ns.load(Ordering::Relaxed);
        if last == 0 {
            return;
        }
        let now = self.clock.now_ns();
        let timeout_ns = self.tuning.connection_timeout_ms * 1_000_000;
        if now.saturating_sub(last) > timeout_ns {
            self.stats.connected.store(false, Ordering::Relaxed);
        }
    }
}

/// One inbound stream: socket, worker thread, shared stats.
pub struct RtpReceiver {
    descriptor: StreamDescriptor,
    mapping_slot: Arc<MappingSlot>,
    fabric: Arc<RingFabric>,
    clock: ClockHandle,
    tuning: ReceiverTuning,
    interface: Option<Ipv4Addr>,
    stats: Arc<RxStats>,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl RtpReceiver {
    pub fn new(
        descriptor: StreamDescriptor,
        mapping_slot: Arc<MappingSlot>,
        fabric: Arc<RingFabric>,
        clock: ClockHandle,
        tuning: ReceiverTuning,
        interface: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            descriptor,
            mapping_slot,
            fabric,
            clock,
            tuning,
            interface,
            stats: Arc::new(RxStats::default()),
            cancel: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Bind, join the multicast group and launch the worker.
    pub fn start(&mut self) -> Result<(), TransportError> {
        let socket = self.open_socket()?;

        self.cancel.store(false, Ordering::SeqCst);
        let cancel = self.cancel.clone();
        let mut engine = RxEngine::new(
            self.descriptor.clone(),
            self.mapping_slot.clone(),
            self.fabric.clone(),
            self.clock.clone(),
            self.stats.clone(),
            self.tuning,
        );
        let name = self.descriptor.session_name.clone();

        self.worker = Some(
            thread::Builder::new()
                .name(format!("aes67-rx {name}"))
                .spawn(move || {
                    receiver_loop(socket, cancel, &mut engine);
                })
                .expect("spawn receiver worker"),
        );

        debug!(
            stream = %self.descriptor.session_name,
            group = %self.descriptor.connection_address,
            port = self.descriptor.port,
            "receiver started"
        );
        Ok(())
    }

    fn open_socket(&self) -> Result<UdpSocket, TransportError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(TransportError::SocketBindFailed)?;
        socket
            .set_reuse_address(true)
            .map_err(TransportError::SocketBindFailed)?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.descriptor.port);
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(TransportError::SocketBindFailed)?;

        let interface = self.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket
            .join_multicast_v4(&self.descriptor.connection_address, &interface)
            .map_err(TransportError::MulticastJoinFailed)?;

        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(TransportError::SocketBindFailed)?;

        Ok(socket.into())
    }

    /// Signal the worker without waiting. Used to cancel several streams
    /// in parallel before joining them one by one.
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Signal the worker and wait for it to exit. The socket closes with
    /// the worker.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.stats.connected.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RxStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn mapping_slot(&self) -> &Arc<MappingSlot> {
        &self.mapping_slot
    }
}

impl Drop for RtpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receiver_loop(socket: UdpSocket, cancel: Arc<AtomicBool>, engine: &mut RxEngine) {
    let mut buf = vec![0u8; 9216];

    while !cancel.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                let source = match peer {
                    SocketAddr::V4(v4) => Some(*v4.ip()),
                    _ => None,
                };
                engine.handle_datagram(&buf[..len], source);
                engine.tick();
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                engine.tick();
            }
            Err(e) => {
                warn!(error = %e, "receiver socket failed, stopping worker");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ChannelMapping;
    use crate::rtp::{encode_l24, PacketBuilder};
    use crate::StreamId;

    fn descriptor(channels: u16) -> StreamDescriptor {
        StreamDescriptor {
            session_name: "rx-test".into(),
            connection_address: Ipv4Addr::new(239, 10, 0, 1),
            num_channels: channels,
            payload_type: 97,
            ..Default::default()
        }
    }

    fn engine(channels: u16, device_start: u16) -> (RxEngine, Arc<RingFabric>, Arc<RxStats>) {
        let d = descriptor(channels);
        let fabric = Arc::new(RingFabric::new(48_000.0));
        let stats = Arc::new(RxStats::default());
        let mapping = Arc::new(MappingSlot::new(ChannelMapping::identity(
            StreamId::generate(),
            "rx-test",
            device_start,
            channels,
        )));
        let engine = RxEngine::new(
            d,
            mapping,
            fabric.clone(),
            crate::clock::get(-1),
            stats.clone(),
            ReceiverTuning::default(),
        );
        (engine, fabric, stats)
    }

    fn packet(builder: &mut PacketBuilder, frames: usize, channels: usize, value: f32) -> Vec<u8> {
        let samples = vec![value; frames * channels];
        let mut payload = vec![0u8; samples.len() * 3];
        encode_l24(&samples, &mut payload);
        builder.next_packet(&payload, frames as u32).to_vec()
    }

    #[test]
    fn decodes_into_mapped_rings() {
        let (mut engine, fabric, stats) = engine(2, 10);
        let mut tx = PacketBuilder::new(1, 97, 100, 0);

        engine.handle_datagram(&packet(&mut tx, 48, 2, 0.5), None);

        assert_eq!(stats.packets_received.load(Ordering::Relaxed), 1);
        assert!(stats.connected.load(Ordering::Relaxed));
        assert_eq!(fabric.input(10).available(), 48);
        assert_eq!(fabric.input(11).available(), 48);
        assert_eq!(fabric.input(12).available(), 0);

        let mut out = [0.0f32; 48];
        fabric.input(10).read(&mut out);
        assert!((out[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn wrong_payload_type_is_malformed() {
        let (mut engine, _fabric, stats) = engine(2, 0);
        let mut tx = PacketBuilder::new(1, 96, 0, 0);
        engine.handle_datagram(&packet(&mut tx, 48, 2, 0.1), None);
        assert_eq!(stats.malformed_packets.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets_received.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn ragged_payload_is_malformed() {
        let (mut engine, _fabric, stats) = engine(2, 0);
        let mut tx = PacketBuilder::new(1, 97, 0, 0);
        let mut data = packet(&mut tx, 4, 2, 0.1);
        data.pop(); // no longer divisible by frame size
        engine.handle_datagram(&data, None);
        assert_eq!(stats.malformed_packets.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn loss_reorder_and_resync_accounting() {
        let (mut engine, _fabric, stats) = engine(1, 0);
        let mut tx = PacketBuilder::new(1, 97, 1000, 0);

        let pkts: Vec<Vec<u8>> = (0..40).map(|_| packet(&mut tx, 4, 1, 0.1)).collect();

        // In order.
        engine.handle_datagram(&pkts[0], None);
        engine.handle_datagram(&pkts[1], None);
        // Gap of 3 (packets 2..=4 missing).
        engine.handle_datagram(&pkts[5], None);
        assert_eq!(stats.packets_lost.load(Ordering::Relaxed), 3);
        // One of the missing ones arrives late: dropped as reorder.
        engine.handle_datagram(&pkts[3], None);
        assert_eq!(stats.reordered_packets.load(Ordering::Relaxed), 1);
        // A jump far beyond the window resyncs without loss accounting.
        engine.handle_datagram(&pkts[39], None);
        assert_eq!(stats.resyncs.load(Ordering::Relaxed), 1);
        assert_eq!(stats.packets_lost.load(Ordering::Relaxed), 3);

        // Everything except the reordered packet was delivered.
        assert_eq!(stats.packets_received.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn sequence_wrap_is_not_loss() {
        let (mut engine, _fabric, stats) = engine(1, 0);
        let mut tx = PacketBuilder::new(1, 97, 65534, 0);

        for _ in 0..4 {
            engine.handle_datagram(&packet(&mut tx, 4, 1, 0.1), None);
        }
        // 65534, 65535, 0, 1 — no loss across the wrap.
        assert_eq!(stats.packets_lost.load(Ordering::Relaxed), 0);
        assert_eq!(stats.packets_received.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn source_filter_discards_other_senders() {
        let (mut engine, _fabric, stats) = engine(1, 0);
        engine.descriptor.source_filter = Some(Ipv4Addr::new(10, 0, 0, 1));
        let mut tx = PacketBuilder::new(1, 97, 0, 0);

        engine.handle_datagram(
            &packet(&mut tx, 4, 1, 0.1),
            Some(Ipv4Addr::new(10, 0, 0, 2)),
        );
        assert_eq!(stats.packets_received.load(Ordering::Relaxed), 0);

        engine.handle_datagram(
            &packet(&mut tx, 4, 1, 0.1),
            Some(Ipv4Addr::new(10, 0, 0, 1)),
        );
        assert_eq!(stats.packets_received.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ring_saturation_counts_dropped_samples() {
        let (mut engine, fabric, stats) = engine(1, 0);
        let mut tx = PacketBuilder::new(1, 97, 0, 0);
        let capacity = fabric.input(0).writable();

        // Each packet carries 48 frames; keep sending without draining.
        let mut sent = 0usize;
        while sent <= capacity + 96 {
            engine.handle_datagram(&packet(&mut tx, 48, 1, 0.1), None);
            sent += 48;
        }

        assert_eq!(fabric.input(0).available(), capacity);
        assert!(stats.drops.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn channels_stay_aligned_under_saturation() {
        let (mut engine, fabric, _stats) = engine(2, 0);
        let mut tx = PacketBuilder::new(1, 97, 0, 0);

        for _ in 0..5 {
            engine.handle_datagram(&packet(&mut tx, 48, 2, 0.3), None);
        }
        // Both rings must have accepted exactly the same amount.
        assert_eq!(fabric.input(0).available(), fabric.input(1).available());
    }

    #[test]
    fn mapping_snapshot_swap_redirects_output() {
        let (mut engine, fabric, _stats) = engine(1, 0);
        let mut tx = PacketBuilder::new(1, 97, 0, 0);

        engine.handle_datagram(&packet(&mut tx, 4, 1, 0.1), None);
        assert_eq!(fabric.input(0).available(), 4);

        engine.mapping_slot.replace(ChannelMapping::identity(
            StreamId::generate(),
            "rx-test",
            64,
            1,
        ));
        engine.handle_datagram(&packet(&mut tx, 4, 1, 0.1), None);
        assert_eq!(fabric.input(0).available(), 4);
        assert_eq!(fabric.input(64).available(), 4);
    }

    #[test]
    fn connection_flag_times_out() {
        let (mut engine, _fabric, stats) = engine(1, 0);
        engine.tuning.connection_timeout_ms = 0;
        let mut tx = PacketBuilder::new(1, 97, 0, 0);

        engine.handle_datagram(&packet(&mut tx, 4, 1, 0.1), None);
        assert!(stats.connected.load(Ordering::Relaxed));

        std::thread::sleep(Duration::from_millis(2));
        engine.tick();
        assert!(!stats.connected.load(Ordering::Relaxed));
    }

    #[test]
    fn start_and_stop_join_deterministically() {
        let d = descriptor(2);
        let mapping = Arc::new(MappingSlot::new(ChannelMapping::identity(
            StreamId::generate(),
            "rx-test",
            0,
            2,
        )));
        let mut rx = RtpReceiver::new(
            d,
            mapping,
            Arc::new(RingFabric::new(48_000.0)),
            crate::clock::get(-1),
            ReceiverTuning::default(),
            None,
        );

        if rx.start().is_ok() {
            assert!(rx.is_running());
            rx.stop();
            assert!(!rx.is_running());
        }
        // Environments without multicast still exercise construction and
        // idempotent stop.
        rx.stop();
    }
}
