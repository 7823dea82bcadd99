//! Stream manager: lifecycle owner for every receiver and transmitter.
//!
//! All mutations go through one streams mutex; the channel map is only
//! touched from here, so its invariants hold at every quiescent point.
//! User callbacks run on the manager's event thread, never on realtime or
//! network threads. The event thread also polls live status and reports
//! `is_connected` transitions.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock;
use crate::descriptor::{AudioEncoding, Direction, StreamDescriptor, StreamId};
use crate::error::{
    AdmissionError, MappingError, PersistError, Result, StreamError, TransportError,
};
use crate::input::stream::RxStatsSnapshot;
use crate::input::RtpReceiver;
use crate::mapping::{ChannelMap, ChannelMapping, MappingSlot};
use crate::output::stream::TxStatsSnapshot;
use crate::output::RtpTransmitter;
use crate::persist::{self, AutoSaver, ConfigStore, PersistedState, PersistedStream};
use crate::ring::RingFabric;
use crate::sdp;

pub use crate::input::ReceiverTuning;

/// Manager-wide settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Local interface for multicast join/egress. `None` lets the OS pick.
    pub interface: Option<Ipv4Addr>,
    pub tuning: ReceiverTuning,
    /// Device sample rate at startup.
    pub sample_rate: f64,
    /// Event-thread status poll period.
    pub status_poll_ms: u64,
    /// Emit a status event whenever a stream's loss/drop counters grow by
    /// this many since the last poll. 0 disables counter events.
    pub status_drop_threshold: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            interface: None,
            tuning: ReceiverTuning::default(),
            sample_rate: 48_000.0,
            status_poll_ms: 100,
            status_drop_threshold: 0,
        }
    }
}

/// Point-in-time view of one managed stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub id: StreamId,
    pub descriptor: StreamDescriptor,
    pub mapping: ChannelMapping,
    pub enabled: bool,
    pub is_running: bool,
    pub is_connected: bool,
    /// Unix seconds when the stream last started.
    pub start_time: u64,
    pub rx: Option<RxStatsSnapshot>,
    pub tx: Option<TxStatsSnapshot>,
}

/// Lifecycle notifications delivered on the manager's event thread.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Added(StreamInfo),
    Removed(StreamInfo),
    StatusChanged(StreamInfo),
}

type Listener = Box<dyn Fn(&StreamEvent) + Send + Sync>;

enum Worker {
    Receiver(RtpReceiver),
    Transmitter(RtpTransmitter),
}

impl Worker {
    fn start(&mut self) -> std::result::Result<(), TransportError> {
        match self {
            Worker::Receiver(r) => r.start(),
            Worker::Transmitter(t) => t.start(),
        }
    }

    fn request_stop(&self) {
        match self {
            Worker::Receiver(r) => r.request_stop(),
            Worker::Transmitter(t) => t.request_stop(),
        }
    }

    fn stop(&mut self) {
        match self {
            Worker::Receiver(r) => r.stop(),
            Worker::Transmitter(t) => t.stop(),
        }
    }

    fn is_running(&self) -> bool {
        match self {
            Worker::Receiver(r) => r.is_running(),
            Worker::Transmitter(t) => t.is_running(),
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Worker::Receiver(r) => r.is_connected(),
            // A transmitter is "connected" for as long as it is pacing.
            Worker::Transmitter(t) => t.is_running(),
        }
    }

    fn mapping_slot(&self) -> &Arc<MappingSlot> {
        match self {
            Worker::Receiver(r) => r.mapping_slot(),
            Worker::Transmitter(t) => t.mapping_slot(),
        }
    }
}

struct ManagedStream {
    descriptor: StreamDescriptor,
    worker: Worker,
    enabled: bool,
    created_at: u64,
    modified_at: u64,
    start_time: u64,
    /// Connection state at the last status poll.
    last_connected: bool,
    /// Loss/drop total at the last status poll.
    last_drop_total: u64,
}

enum EventCmd {
    Emit(StreamEvent),
    Shutdown,
}

struct Shared {
    streams: Mutex<HashMap<StreamId, ManagedStream>>,
    map: ChannelMap,
    fabric: Arc<RingFabric>,
    device_rate: Mutex<f64>,
    config: ManagerConfig,
    listeners: Mutex<Vec<Listener>>,
    autosave: Mutex<Option<AutoSaver>>,
}

impl Shared {
    fn info_of(&self, id: StreamId, stream: &ManagedStream) -> StreamInfo {
        let (rx, tx) = match &stream.worker {
            Worker::Receiver(r) => (Some(r.stats()), None),
            Worker::Transmitter(t) => (None, Some(t.stats())),
        };
        StreamInfo {
            id,
            descriptor: stream.descriptor.clone(),
            mapping: self
                .map
                .get(id)
                .unwrap_or_else(|| ChannelMapping::identity(id, "", 0, 1)),
            enabled: stream.enabled,
            is_running: stream.worker.is_running(),
            is_connected: stream.worker.is_connected(),
            start_time: stream.start_time,
            rx,
            tx,
        }
    }

    fn dispatch(&self, event: &StreamEvent) {
        for listener in self.listeners.lock().iter() {
            listener(event);
        }
    }

    fn snapshot_state(&self) -> PersistedState {
        let streams = self.streams.lock();
        let records = streams
            .iter()
            .filter_map(|(id, s)| {
                self.map.get(*id).map(|mapping| PersistedStream {
                    descriptor: s.descriptor.clone(),
                    mapping,
                    enabled: s.enabled,
                    created_at: s.created_at,
                    modified_at: s.modified_at,
                })
            })
            .collect();
        PersistedState::new(records)
    }
}

/// Owner of all receive and transmit streams.
pub struct StreamManager {
    shared: Arc<Shared>,
    event_tx: Sender<EventCmd>,
    event_thread: Option<JoinHandle<()>>,
}

impl StreamManager {
    pub fn new(config: ManagerConfig, fabric: Arc<RingFabric>) -> Self {
        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            map: ChannelMap::new(),
            fabric,
            device_rate: Mutex::new(config.sample_rate),
            config,
            listeners: Mutex::new(Vec::new()),
            autosave: Mutex::new(None),
        });

        let (event_tx, event_rx) = unbounded();
        let thread_shared = shared.clone();
        let poll = Duration::from_millis(thread_shared.config.status_poll_ms.max(10));
        let event_thread = thread::Builder::new()
            .name("aes67-events".to_string())
            .spawn(move || event_loop(thread_shared, event_rx, poll))
            .expect("spawn manager event thread");

        Self {
            shared,
            event_tx,
            event_thread: Some(event_thread),
        }
    }

    /// Register a callback for stream lifecycle and status events.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().push(Box::new(listener));
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn admit(
        &self,
        descriptor: &StreamDescriptor,
        streams: &HashMap<StreamId, ManagedStream>,
    ) -> Result<()> {
        descriptor.validate()?;
        if !descriptor.encoding.has_codec() {
            return Err(AdmissionError::UnsupportedEncoding(descriptor.encoding).into());
        }

        let device_rate = *self.shared.device_rate.lock();
        if (device_rate - descriptor.sample_rate as f64).abs() > 0.1 {
            return Err(AdmissionError::SampleRateMismatch {
                expected: device_rate,
                got: descriptor.sample_rate,
            }
            .into());
        }

        for stream in streams.values() {
            if stream.descriptor.connection_address == descriptor.connection_address
                && stream.descriptor.port == descriptor.port
                && stream.descriptor.direction == descriptor.direction
            {
                return Err(AdmissionError::EndpointConflict.into());
            }
        }
        Ok(())
    }

    /// The agreement invariant: the mapping window must cover exactly the
    /// descriptor's channels past the stream offset.
    fn check_agreement(
        descriptor: &StreamDescriptor,
        mapping: &ChannelMapping,
    ) -> Result<()> {
        let expected = descriptor
            .num_channels
            .checked_sub(mapping.stream_channel_offset);
        if expected != Some(mapping.stream_channel_count) {
            return Err(MappingError::OutOfRange.into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stream creation
    // ------------------------------------------------------------------

    /// Admit a receive stream, auto-placing it on the lowest free block.
    pub fn add_receive_stream(&self, mut descriptor: StreamDescriptor) -> Result<StreamId> {
        descriptor.direction = Direction::RecvOnly;
        let id = StreamId::generate();
        let mut streams = self.shared.streams.lock();
        self.admit(&descriptor, &streams)?;

        let free = self.shared.map.free_count();
        let mapping = self
            .shared
            .map
            .auto_place(id, &descriptor.session_name, descriptor.num_channels)
            .ok_or(AdmissionError::InsufficientChannels {
                needed: descriptor.num_channels,
                available: free,
            })?;
        self.shared.map.add(mapping.clone())?;

        self.install_stream(id, descriptor, mapping, true, &mut streams)
    }

    /// Admit a receive stream with a caller-supplied mapping.
    pub fn add_receive_stream_with_mapping(
        &self,
        mut descriptor: StreamDescriptor,
        mut mapping: ChannelMapping,
    ) -> Result<StreamId> {
        descriptor.direction = Direction::RecvOnly;
        let id = StreamId::generate();
        let mut streams = self.shared.streams.lock();
        self.admit(&descriptor, &streams)?;
        Self::check_agreement(&descriptor, &mapping)?;

        mapping.stream_id = id;
        mapping.stream_name = descriptor.session_name.clone();
        self.shared.map.add(mapping.clone())?;

        self.install_stream(id, descriptor, mapping, true, &mut streams)
    }

    /// Build and start a transmit stream at the device's current rate
    /// (L24, payload type 97).
    pub fn create_transmit_stream(
        &self,
        name: &str,
        multicast: Ipv4Addr,
        port: u16,
        num_channels: u16,
        mapping: Option<ChannelMapping>,
    ) -> Result<StreamId> {
        let device_rate = *self.shared.device_rate.lock();
        let sample_rate = device_rate.round() as u32;
        let framecount = sample_rate / 1000;
        let descriptor = StreamDescriptor {
            session_name: name.to_string(),
            session_info: None,
            origin_address: self
                .shared
                .config
                .interface
                .map(|i| i.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            connection_address: multicast,
            port,
            ttl: crate::DEFAULT_TTL,
            source_filter: None,
            encoding: AudioEncoding::L24,
            sample_rate,
            num_channels,
            payload_type: 97,
            // Exact by construction, even for 44.1 kHz family rates.
            ptime_ms: framecount as f64 * 1000.0 / sample_rate as f64,
            framecount,
            ptp_domain: 0,
            master_clock_id: None,
            media_clock: Some("direct=0".to_string()),
            direction: Direction::SendOnly,
            extra_attributes: Vec::new(),
        };

        let id = StreamId::generate();
        let mut streams = self.shared.streams.lock();
        self.admit(&descriptor, &streams)?;

        let mapping = match mapping {
            Some(mut m) => {
                Self::check_agreement(&descriptor, &m)?;
                m.stream_id = id;
                m.stream_name = descriptor.session_name.clone();
                m
            }
            None => {
                let free = self.shared.map.free_count();
                self.shared
                    .map
                    .auto_place(id, name, num_channels)
                    .ok_or(AdmissionError::InsufficientChannels {
                        needed: num_channels,
                        available: free,
                    })?
            }
        };
        self.shared.map.add(mapping.clone())?;

        self.install_stream(id, descriptor, mapping, true, &mut streams)
    }

    /// Shared tail of every admission path: construct the worker, start it
    /// when enabled, insert, notify, persist.
    fn install_stream(
        &self,
        id: StreamId,
        descriptor: StreamDescriptor,
        mapping: ChannelMapping,
        enabled: bool,
        streams: &mut HashMap<StreamId, ManagedStream>,
    ) -> Result<StreamId> {
        let slot = Arc::new(MappingSlot::new(mapping));
        let handle = clock::get(descriptor.ptp_domain);

        let mut worker = match descriptor.direction {
            Direction::RecvOnly => Worker::Receiver(RtpReceiver::new(
                descriptor.clone(),
                slot,
                self.shared.fabric.clone(),
                handle,
                self.shared.config.tuning,
                self.shared.config.interface,
            )),
            Direction::SendOnly => Worker::Transmitter(RtpTransmitter::new(
                descriptor.clone(),
                slot,
                self.shared.fabric.clone(),
                handle,
                self.shared.config.interface,
            )),
        };

        if enabled {
            if let Err(e) = worker.start() {
                self.shared.map.remove(id);
                return Err(e.into());
            }
        }

        let now = persist::unix_now();
        let stream = ManagedStream {
            descriptor,
            worker,
            enabled,
            created_at: now,
            modified_at: now,
            start_time: if enabled { now } else { 0 },
            last_connected: false,
            last_drop_total: 0,
        };

        info!(stream = %stream.descriptor.session_name, %id, "stream admitted");
        let event = StreamEvent::Added(self.shared.info_of(id, &stream));
        streams.insert(id, stream);
        let _ = self.event_tx.send(EventCmd::Emit(event));
        self.autosave_locked(streams);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // SDP files
    // ------------------------------------------------------------------

    /// Create a receive stream from an SDP file.
    pub fn import_sdp_file(&self, path: &Path) -> Result<StreamId> {
        let text =
            std::fs::read_to_string(path).map_err(|e| PersistError::IoFailed(e))?;
        let descriptor = sdp::parse(&text)?;
        self.add_receive_stream(descriptor)
    }

    /// Write a stream's SDP session to a file.
    pub fn export_sdp_file(&self, id: StreamId, path: &Path) -> Result<()> {
        let streams = self.shared.streams.lock();
        let stream = streams.get(&id).ok_or(StreamError::NotFound)?;
        let text = sdp::generate(&stream.descriptor);
        drop(streams);
        std::fs::write(path, text).map_err(|e| PersistError::IoFailed(e))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal and updates
    // ------------------------------------------------------------------

    /// Stop and destroy one stream. The worker is joined before return.
    pub fn remove(&self, id: StreamId) -> Result<()> {
        let mut stream = {
            let mut streams = self.shared.streams.lock();
            streams.remove(&id).ok_or(StreamError::NotFound)?
        };

        let info = self.shared.info_of(id, &stream);
        stream.worker.request_stop();
        stream.worker.stop();
        self.shared.map.remove(id);

        info!(stream = %stream.descriptor.session_name, %id, "stream removed");
        let _ = self.event_tx.send(EventCmd::Emit(StreamEvent::Removed(info)));
        self.autosave();
        Ok(())
    }

    /// Cancel every stream in parallel, then join them all.
    pub fn remove_all(&self) {
        let drained: Vec<(StreamId, ManagedStream)> = {
            let mut streams = self.shared.streams.lock();
            streams.drain().collect()
        };
        if drained.is_empty() {
            return;
        }

        for (_, stream) in &drained {
            stream.worker.request_stop();
        }
        for (id, mut stream) in drained {
            let info = self.shared.info_of(id, &stream);
            stream.worker.stop();
            self.shared.map.remove(id);
            let _ = self.event_tx.send(EventCmd::Emit(StreamEvent::Removed(info)));
        }
        self.autosave();
    }

    /// Re-map a live stream. The worker sees the new snapshot on its next
    /// packet without stopping.
    pub fn update_mapping(&self, id: StreamId, mut mapping: ChannelMapping) -> Result<()> {
        let mut streams = self.shared.streams.lock();
        let stream = streams.get_mut(&id).ok_or(StreamError::NotFound)?;

        Self::check_agreement(&stream.descriptor, &mapping)?;
        mapping.stream_id = id;
        self.shared.map.update(mapping.clone())?;
        stream.worker.mapping_slot().replace(mapping);
        stream.modified_at = persist::unix_now();

        self.autosave_locked(&streams);
        Ok(())
    }

    /// Start or stop a stream without forgetting it.
    pub fn set_stream_enabled(&self, id: StreamId, enabled: bool) -> Result<()> {
        let mut streams = self.shared.streams.lock();
        let stream = streams.get_mut(&id).ok_or(StreamError::NotFound)?;

        if enabled && !stream.worker.is_running() {
            stream.worker.start()?;
            stream.start_time = persist::unix_now();
        } else if !enabled {
            if !stream.worker.is_running() {
                return Err(StreamError::AlreadyStopped.into());
            }
            stream.worker.request_stop();
            stream.worker.stop();
        }
        stream.enabled = enabled;
        stream.modified_at = persist::unix_now();

        let event = StreamEvent::StatusChanged(self.shared.info_of(id, stream));
        let _ = self.event_tx.send(EventCmd::Emit(event));
        self.autosave_locked(&streams);
        Ok(())
    }

    /// Change the device rate. Succeeds only while every live stream
    /// already runs at the new rate.
    pub fn set_device_sample_rate(&self, rate: f64) -> Result<()> {
        let streams = self.shared.streams.lock();
        for stream in streams.values() {
            if (stream.descriptor.sample_rate as f64 - rate).abs() > 0.1 {
                return Err(AdmissionError::SampleRateMismatch {
                    expected: rate,
                    got: stream.descriptor.sample_rate,
                }
                .into());
            }
        }
        *self.shared.device_rate.lock() = rate;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn device_sample_rate(&self) -> f64 {
        *self.shared.device_rate.lock()
    }

    pub fn active_streams(&self) -> Vec<StreamInfo> {
        let streams = self.shared.streams.lock();
        streams
            .iter()
            .map(|(id, s)| self.shared.info_of(*id, s))
            .collect()
    }

    pub fn stream_info(&self, id: StreamId) -> Result<StreamInfo> {
        let streams = self.shared.streams.lock();
        streams
            .get(&id)
            .map(|s| self.shared.info_of(id, s))
            .ok_or_else(|| StreamError::NotFound.into())
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.shared.streams.lock().contains_key(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    /// Free device channels, per the channel map.
    pub fn available_channels(&self) -> u16 {
        self.shared.map.free_count()
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.shared.map
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Persist the configuration after every mutation, asynchronously,
    /// until disabled.
    pub fn enable_autosave(&self, store: Box<dyn ConfigStore>, path: PathBuf) {
        *self.shared.autosave.lock() = Some(AutoSaver::spawn(store, path));
        self.autosave();
    }

    /// Stop persisting. Pending writes are flushed.
    pub fn disable_autosave(&self) {
        self.shared.autosave.lock().take();
    }

    fn autosave(&self) {
        // Lock order everywhere is streams before autosave; build the
        // snapshot before touching the autosave mutex.
        if self.shared.autosave.lock().is_none() {
            return;
        }
        let state = self.shared.snapshot_state();
        if let Some(saver) = self.shared.autosave.lock().as_ref() {
            saver.save_async(state);
        }
    }

    /// Autosave variant for paths already holding the streams lock.
    fn autosave_locked(&self, streams: &HashMap<StreamId, ManagedStream>) {
        let saver = self.shared.autosave.lock();
        if let Some(saver) = saver.as_ref() {
            let records = streams
                .iter()
                .filter_map(|(id, s)| {
                    self.shared.map.get(*id).map(|mapping| PersistedStream {
                        descriptor: s.descriptor.clone(),
                        mapping,
                        enabled: s.enabled,
                        created_at: s.created_at,
                        modified_at: s.modified_at,
                    })
                })
                .collect();
            saver.save_async(PersistedState::new(records));
        }
    }

    /// Load a persisted document and re-admit its records. Records that no
    /// longer pass admission are dropped with a warning. Returns how many
    /// streams were restored.
    pub fn restore_from(&self, store: &dyn ConfigStore, path: &Path) -> Result<usize> {
        let bytes = store.load(path).map_err(PersistError::IoFailed)?;
        let state = persist::decode(&bytes)?;

        let mut restored = 0usize;
        for record in state.streams {
            let name = record.descriptor.session_name.clone();
            match self.restore_record(record) {
                Ok(_) => restored += 1,
                Err(e) => {
                    warn!(stream = %name, error = %e, "dropping invalid persisted stream");
                }
            }
        }
        debug!(restored, "configuration restored");
        Ok(restored)
    }

    fn restore_record(&self, record: PersistedStream) -> Result<StreamId> {
        let descriptor = record.descriptor;
        let mut mapping = record.mapping;
        let id = StreamId::generate();

        let mut streams = self.shared.streams.lock();
        self.admit(&descriptor, &streams)?;
        Self::check_agreement(&descriptor, &mapping)?;
        mapping.stream_id = id;
        self.shared.map.add(mapping.clone())?;

        let result = self.install_stream(id, descriptor, mapping, record.enabled, &mut streams);
        if let Ok(id) = result {
            if let Some(stream) = streams.get_mut(&id) {
                stream.created_at = record.created_at;
                stream.modified_at = record.modified_at;
            }
        }
        result
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        // Flush pending saves of the pre-shutdown state, then tear down
        // without rewriting the config as empty.
        self.disable_autosave();
        self.remove_all();

        let _ = self.event_tx.send(EventCmd::Shutdown);
        if let Some(thread) = self.event_thread.take() {
            let _ = thread.join();
        }
    }
}

fn event_loop(shared: Arc<Shared>, rx: Receiver<EventCmd>, poll: Duration) {
    loop {
        match rx.recv_timeout(poll) {
            Ok(EventCmd::Emit(event)) => shared.dispatch(&event),
            Ok(EventCmd::Shutdown) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                for event in poll_status(&shared) {
                    shared.dispatch(&event);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Detect `is_connected` transitions and counter excursions since the
/// previous poll.
fn poll_status(shared: &Shared) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let threshold = shared.config.status_drop_threshold;
    let mut streams = shared.streams.lock();
    let ids: Vec<StreamId> = streams.keys().copied().collect();
    for id in ids {
        let Some(stream) = streams.get_mut(&id) else {
            continue;
        };

        let mut notify = false;
        let connected = stream.worker.is_connected();
        if connected != stream.last_connected {
            stream.last_connected = connected;
            notify = true;
        }

        if threshold > 0 {
            let drop_total = match &stream.worker {
                Worker::Receiver(r) => {
                    let s = r.stats();
                    s.packets_lost + s.drops
                }
                Worker::Transmitter(t) => {
                    let s = t.stats();
                    s.underruns + s.send_errors
                }
            };
            if drop_total.saturating_sub(stream.last_drop_total) >= threshold {
                stream.last_drop_total = drop_total;
                notify = true;
            }
        }

        if notify {
            let info = shared.info_of(id, stream);
            events.push(StreamEvent::StatusChanged(info));
        }
    }
    events
}
