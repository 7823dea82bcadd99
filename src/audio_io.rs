//! Realtime boundary between the host audio callback and the ring fabric.
//!
//! Both callbacks are allocation-free and lock-free: a fixed stack scratch
//! buffer, batch ring transfers and relaxed atomic counters. Shortfalls are
//! normal operation (the rings saturate or drain), accounted once per
//! callback and never surfaced as errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ring::RingFabric;
use crate::{DEVICE_CHANNELS, MAX_CALLBACK_FRAMES};

/// Outcome of one host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CallbackStatus {
    Ok,
    /// The host delivered a buffer that is not 128 channels wide (or too
    /// short for its stated geometry). Output was silenced.
    BadChannelLayout,
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoStats {
    pub callbacks: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub layout_errors: u64,
}

/// Host-callback side of the transfer fabric.
pub struct AudioIoHandler {
    fabric: Arc<RingFabric>,
    callbacks: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    layout_errors: AtomicU64,
}

impl AudioIoHandler {
    pub fn new(fabric: Arc<RingFabric>) -> Self {
        Self {
            fabric,
            callbacks: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            layout_errors: AtomicU64::new(0),
        }
    }

    pub fn fabric(&self) -> &Arc<RingFabric> {
        &self.fabric
    }

    /// Network-to-host direction. Fills `out` (interleaved,
    /// `frame_count * channel_count` floats) from the input rings,
    /// zero-filling any shortfall.
    pub fn on_input_callback(
        &self,
        frame_count: usize,
        channel_count: usize,
        out: &mut [f32],
    ) -> CallbackStatus {
        self.callbacks.fetch_add(1, Ordering::Relaxed);

        if channel_count != DEVICE_CHANNELS || out.len() < frame_count * channel_count {
            for sample in out.iter_mut() {
                *sample = 0.0;
            }
            self.layout_errors.fetch_add(1, Ordering::Relaxed);
            return CallbackStatus::BadChannelLayout;
        }

        let mut scratch = [0.0f32; MAX_CALLBACK_FRAMES];
        let mut short = false;
        let mut done = 0usize;

        while done < frame_count {
            let chunk = (frame_count - done).min(MAX_CALLBACK_FRAMES);
            for c in 0..DEVICE_CHANNELS {
                let got = self.fabric.input(c).read(&mut scratch[..chunk]);
                if got < chunk {
                    short = true;
                    for s in scratch[got..chunk].iter_mut() {
                        *s = 0.0;
                    }
                }
                for f in 0..chunk {
                    out[(done + f) * channel_count + c] = scratch[f];
                }
            }
            done += chunk;
        }

        if short {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        CallbackStatus::Ok
    }

    /// Host-to-network direction. Pushes the interleaved host buffer into
    /// the output rings; samples the rings cannot take are dropped.
    pub fn on_output_callback(
        &self,
        frame_count: usize,
        channel_count: usize,
        input: &[f32],
    ) -> CallbackStatus {
        self.callbacks.fetch_add(1, Ordering::Relaxed);

        if channel_count != DEVICE_CHANNELS || input.len() < frame_count * channel_count {
            self.layout_errors.fetch_add(1, Ordering::Relaxed);
            return CallbackStatus::BadChannelLayout;
        }

        let mut scratch = [0.0f32; MAX_CALLBACK_FRAMES];
        let mut short = false;
        let mut done = 0usize;

        while done < frame_count {
            let chunk = (frame_count - done).min(MAX_CALLBACK_FRAMES);
            for c in 0..DEVICE_CHANNELS {
                for f in 0..chunk {
                    scratch[f] = input[(done + f) * channel_count + c];
                }
                let accepted = self.fabric.output(c).write(&scratch[..chunk]);
                if accepted < chunk {
                    short = true;
                }
            }
            done += chunk;
        }

        if short {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
        CallbackStatus::Ok
    }

    pub fn stats(&self) -> IoStats {
        IoStats {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            layout_errors: self.layout_errors.load(Ordering::Relaxed),
        }
    }
}
