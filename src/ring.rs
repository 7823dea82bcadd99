//! Lock-free audio transfer fabric.
//!
//! One bounded single-producer/single-consumer float ring per device channel
//! per direction. The producer and consumer each own one index; publishing
//! uses release stores, observing uses acquire loads. The single-producer /
//! single-consumer discipline is a contract between the caller threads, not
//! enforced at runtime.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{DEVICE_CHANNELS, RING_SAFETY_MS};

/// Smallest ring capacity in samples.
pub const MIN_RING_CAPACITY: usize = 64;
/// Largest ring capacity in samples.
pub const MAX_RING_CAPACITY: usize = 2048;

/// Ring capacity for a sample rate: `ceil(rate * safety_ms / 1000)`,
/// clamped to `[MIN_RING_CAPACITY, MAX_RING_CAPACITY]`.
pub fn capacity_for_rate(sample_rate: f64, safety_ms: f64) -> usize {
    let raw = (sample_rate * safety_ms / 1000.0).ceil() as usize;
    raw.clamp(MIN_RING_CAPACITY, MAX_RING_CAPACITY)
}

/// Index padded to its own cache line so the producer and consumer
/// indices never share one.
#[repr(align(64))]
struct PaddedIndex(AtomicUsize);

/// Bounded SPSC float ring.
///
/// One slot is always kept empty, so at most `capacity() - 1` samples are
/// readable at once. All operations are non-blocking, allocation-free and
/// wait-free; partial transfers on saturation are normal and the caller
/// accounts for the shortfall.
pub struct Ring {
    buf: UnsafeCell<Box<[f32]>>,
    capacity: usize,
    /// Next slot to read. Written only by the consumer.
    head: PaddedIndex,
    /// Next slot to write. Written only by the producer.
    tail: PaddedIndex,
}

// The UnsafeCell is only touched from the producer side (slots in
// [tail, head)) and consumer side (slots in [head, tail)), which never
// alias under the SPSC contract.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Create a ring holding up to `capacity - 1` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_RING_CAPACITY, MAX_RING_CAPACITY);
        Self {
            buf: UnsafeCell::new(vec![0.0; capacity].into_boxed_slice()),
            capacity,
            head: PaddedIndex(AtomicUsize::new(0)),
            tail: PaddedIndex(AtomicUsize::new(0)),
        }
    }

    /// Create a ring sized for `sample_rate` with the default safety window.
    pub fn for_rate(sample_rate: f64) -> Self {
        Self::new(capacity_for_rate(sample_rate, RING_SAFETY_MS))
    }

    /// Total slot count (one more than the usable sample count).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples currently readable.
    pub fn available(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail.wrapping_sub(head).wrapping_add(self.capacity) % self.capacity
    }

    /// Free space in samples. Never exceeds `capacity() - 1`.
    pub fn writable(&self) -> usize {
        self.capacity - 1 - self.available()
    }

    /// Producer side: append up to `samples.len()` samples.
    /// Returns how many were accepted.
    pub fn write(&self, samples: &[f32]) -> usize {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        let used = tail.wrapping_sub(head).wrapping_add(self.capacity) % self.capacity;
        let free = self.capacity - 1 - used;
        let n = samples.len().min(free);
        if n == 0 {
            return 0;
        }

        let buf = unsafe { &mut *self.buf.get() };
        let first = n.min(self.capacity - tail);
        buf[tail..tail + first].copy_from_slice(&samples[..first]);
        if first < n {
            buf[..n - first].copy_from_slice(&samples[first..n]);
        }

        self.tail.0.store((tail + n) % self.capacity, Ordering::Release);
        n
    }

    /// Consumer side: remove up to `out.len()` samples into `out`.
    /// Returns how many were produced.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        let avail = tail.wrapping_sub(head).wrapping_add(self.capacity) % self.capacity;
        let n = out.len().min(avail);
        if n == 0 {
            return 0;
        }

        let buf = unsafe { &*self.buf.get() };
        let first = n.min(self.capacity - head);
        out[..first].copy_from_slice(&buf[head..head + first]);
        if first < n {
            out[first..n].copy_from_slice(&buf[..n - first]);
        }

        self.head.0.store((head + n) % self.capacity, Ordering::Release);
        n
    }

    /// Consumer side: discard everything currently readable.
    pub fn reset(&self) {
        let tail = self.tail.0.load(Ordering::Acquire);
        self.head.0.store(tail, Ordering::Release);
    }
}

/// The full transfer fabric: 128 input rings (network to host) and
/// 128 output rings (host to network).
///
/// Owned by the audio device construct; receivers and transmitters hold
/// shared references that the stream manager tears down before the fabric.
pub struct RingFabric {
    input: Vec<Ring>,
    output: Vec<Ring>,
}

impl RingFabric {
    /// Build a fabric with per-ring capacity derived from the sample rate.
    pub fn new(sample_rate: f64) -> Self {
        let make = || -> Vec<Ring> {
            (0..DEVICE_CHANNELS).map(|_| Ring::for_rate(sample_rate)).collect()
        };
        Self {
            input: make(),
            output: make(),
        }
    }

    /// Input ring (network producer, audio-callback consumer) for a device channel.
    pub fn input(&self, channel: usize) -> &Ring {
        &self.input[channel]
    }

    /// Output ring (audio-callback producer, network consumer) for a device channel.
    pub fn output(&self, channel: usize) -> &Ring {
        &self.output[channel]
    }

    /// Drain the rings of one direction for a span of device channels.
    /// Used when a stream is admitted so stale samples never play.
    pub fn reset_input_span(&self, start: usize, count: usize) {
        for ring in &self.input[start..(start + count).min(DEVICE_CHANNELS)] {
            ring.reset();
        }
    }

    pub fn reset_output_span(&self, start: usize, count: usize) {
        for ring in &self.output[start..(start + count).min(DEVICE_CHANNELS)] {
            ring.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capacity_clamps() {
        // 2 ms at 8 kHz would be 16 samples; clamps up to 64.
        assert_eq!(capacity_for_rate(8_000.0, 2.0), 64);
        assert_eq!(capacity_for_rate(48_000.0, 2.0), 96);
        // 2 ms at 384 kHz is 768 samples.
        assert_eq!(capacity_for_rate(384_000.0, 2.0), 768);
        // An absurd safety window clamps down to 2048.
        assert_eq!(capacity_for_rate(384_000.0, 100.0), 2048);
    }

    #[test]
    fn fifo_order_preserved() {
        let ring = Ring::new(64);
        let input: Vec<f32> = (0..40).map(|i| i as f32).collect();
        assert_eq!(ring.write(&input), 40);

        let mut out = [0.0f32; 16];
        assert_eq!(ring.read(&mut out), 16);
        assert_eq!(&out[..], &input[..16]);

        // Interleave more writes with reads; output must stay a prefix of
        // the write sequence.
        let more: Vec<f32> = (40..80).map(|i| i as f32).collect();
        let accepted = ring.write(&more);
        let mut rest = vec![0.0f32; 64];
        let n = ring.read(&mut rest);
        assert_eq!(n, 24 + accepted);
        for (i, &s) in rest[..n].iter().enumerate() {
            assert_eq!(s, (16 + i) as f32);
        }
    }

    #[test]
    fn partial_write_on_saturation() {
        let ring = Ring::new(64);
        assert_eq!(ring.writable(), 63);

        let input = vec![1.0f32; 100];
        assert_eq!(ring.write(&input), 63);
        assert_eq!(ring.writable(), 0);
        assert_eq!(ring.write(&input), 0);
        assert_eq!(ring.available(), 63);
    }

    #[test]
    fn partial_read_when_drained() {
        let ring = Ring::new(64);
        ring.write(&[1.0, 2.0, 3.0]);
        let mut out = [0.0f32; 8];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn wraparound_keeps_data_intact() {
        let ring = Ring::new(64);
        let mut next_write = 0u32;
        let mut next_read = 0u32;
        let mut out = [0.0f32; 48];

        for _ in 0..50 {
            let chunk: Vec<f32> = (next_write..next_write + 48).map(|i| i as f32).collect();
            let w = ring.write(&chunk);
            next_write += w as u32;

            let r = ring.read(&mut out);
            for &s in &out[..r] {
                assert_eq!(s, next_read as f32);
                next_read += 1;
            }
        }
        assert_eq!(next_read, next_write);
    }

    #[test]
    fn reset_discards_pending() {
        let ring = Ring::new(64);
        ring.write(&[1.0; 20]);
        ring.reset();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.writable(), 63);
    }

    #[test]
    fn concurrent_spsc_prefix_law() {
        let ring = Arc::new(Ring::new(256));
        let total = 100_000u32;

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                let mut next = 0u32;
                while next < total {
                    let end = (next + 37).min(total);
                    let chunk: Vec<f32> = (next..end).map(|i| i as f32).collect();
                    next += ring.write(&chunk) as u32;
                }
            })
        };

        let mut seen = 0u32;
        let mut out = [0.0f32; 113];
        while seen < total {
            let n = ring.read(&mut out);
            for &s in &out[..n] {
                assert_eq!(s, seen as f32);
                seen += 1;
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn fabric_directions_are_disjoint() {
        let fabric = RingFabric::new(48_000.0);
        fabric.input(5).write(&[0.5; 10]);
        assert_eq!(fabric.output(5).available(), 0);
        assert_eq!(fabric.input(5).available(), 10);

        fabric.reset_input_span(0, DEVICE_CHANNELS);
        assert_eq!(fabric.input(5).available(), 0);
    }
}
