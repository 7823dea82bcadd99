//! Boundary to the host audio shell.
//!
//! `VirtualDevice` bundles the ring fabric, the realtime I/O handler and
//! the stream manager into the one object the host plug-in talks to.
//! Construction is two-phase: `new` builds plain state, `initialize` runs
//! once the shared handle is observable and may admit streams (restoring
//! persisted configuration). Host shells whose base classes hand out
//! self-referential handles call the two phases at the two points their
//! lifecycle allows.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audio_io::{AudioIoHandler, CallbackStatus};
use crate::error::{BridgeError, PersistError, Result};
use crate::manager::{ManagerConfig, StreamManager};
use crate::persist::ConfigStore;
use crate::ring::RingFabric;
use crate::DEVICE_CHANNELS;

/// The virtual 128-channel device as the host shell sees it.
pub struct VirtualDevice {
    manager: StreamManager,
    audio: AudioIoHandler,
    fabric: Arc<RingFabric>,
    initialized: AtomicBool,
    io_running: AtomicBool,
}

impl VirtualDevice {
    /// Phase one: allocate the fabric and manager. No streams exist and no
    /// sockets are open afterwards.
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let fabric = Arc::new(RingFabric::new(config.sample_rate));
        let audio = AudioIoHandler::new(fabric.clone());
        let manager = StreamManager::new(config, fabric.clone());
        Arc::new(Self {
            manager,
            audio,
            fabric,
            initialized: AtomicBool::new(false),
            io_running: AtomicBool::new(false),
        })
    }

    /// Phase two, called once the `Arc` is observable by the host shell.
    /// Restores persisted streams and turns on auto-save when a store is
    /// supplied. Idempotent; later calls return 0.
    pub fn initialize(
        self: &Arc<Self>,
        persisted: Option<(Box<dyn ConfigStore>, PathBuf)>,
    ) -> Result<usize> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let mut restored = 0;
        if let Some((store, path)) = persisted {
            match self.manager.restore_from(store.as_ref(), &path) {
                Ok(n) => restored = n,
                // A missing document is a first run, not a failure.
                Err(BridgeError::Persist(PersistError::IoFailed(e))) => {
                    debug!(path = %path.display(), error = %e, "no persisted configuration");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "persisted configuration unusable");
                }
            }
            self.manager.enable_autosave(store, path);
        }

        info!(restored, "virtual device initialized");
        Ok(restored)
    }

    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    pub fn audio(&self) -> &AudioIoHandler {
        &self.audio
    }

    /// Host notification: the audio engine is about to start calling.
    /// Stale fabric content from the previous run is discarded.
    pub fn io_started(&self) {
        self.fabric.reset_input_span(0, DEVICE_CHANNELS);
        self.fabric.reset_output_span(0, DEVICE_CHANNELS);
        self.io_running.store(true, Ordering::SeqCst);
        debug!("host io started");
    }

    /// Host notification: callbacks have stopped.
    pub fn io_stopped(&self) {
        self.io_running.store(false, Ordering::SeqCst);
        debug!("host io stopped");
    }

    pub fn is_io_running(&self) -> bool {
        self.io_running.load(Ordering::SeqCst)
    }

    /// Realtime input callback (network to host). Before `io_started` the
    /// device answers with silence.
    pub fn on_input_callback(
        &self,
        frame_count: usize,
        channel_count: usize,
        out: &mut [f32],
    ) -> CallbackStatus {
        if !self.io_running.load(Ordering::Relaxed) {
            for sample in out.iter_mut() {
                *sample = 0.0;
            }
            return CallbackStatus::Ok;
        }
        self.audio.on_input_callback(frame_count, channel_count, out)
    }

    /// Realtime output callback (host to network).
    pub fn on_output_callback(
        &self,
        frame_count: usize,
        channel_count: usize,
        input: &[f32],
    ) -> CallbackStatus {
        if !self.io_running.load(Ordering::Relaxed) {
            return CallbackStatus::Ok;
        }
        self.audio.on_output_callback(frame_count, channel_count, input)
    }

    /// Host format change. Fails while streams at the old rate are live;
    /// the fabric keeps its original geometry, so hosts that change rate
    /// tear this device down and build a fresh one.
    pub fn set_sample_rate(&self, rate: f64) -> Result<()> {
        self.manager.set_device_sample_rate(rate)
    }

    pub fn sample_rate(&self) -> f64 {
        self.manager.device_sample_rate()
    }
}
