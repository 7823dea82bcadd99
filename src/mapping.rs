//! Channel mapping: which device channels a stream owns.
//!
//! The `ChannelMap` is the single authority for the 128 device slots per
//! direction-independent mapping table. A forward table (stream to mapping)
//! and a reverse index (device channel to owner) are kept in lock-step
//! behind one mutex; every operation is O(128) worst case.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::descriptor::StreamId;
use crate::error::MappingError;
use crate::DEVICE_CHANNELS;

/// Assignment of one stream's channels onto device channels.
///
/// With an empty `permutation` the mapping is the identity window
/// `[device_channel_start, device_channel_start + device_channel_count)`.
/// A non-empty permutation lists the absolute device channel for each
/// stream channel instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub stream_id: StreamId,
    /// Denormalized stream name, carried for UI listings.
    pub stream_name: String,
    pub stream_channel_count: u16,
    pub stream_channel_offset: u16,
    pub device_channel_start: u16,
    pub device_channel_count: u16,
    #[serde(default)]
    pub permutation: Vec<u16>,
}

impl ChannelMapping {
    /// Identity mapping of `count` channels starting at `start`.
    pub fn identity(stream_id: StreamId, name: &str, start: u16, count: u16) -> Self {
        Self {
            stream_id,
            stream_name: name.to_string(),
            stream_channel_count: count,
            stream_channel_offset: 0,
            device_channel_start: start,
            device_channel_count: count,
            permutation: Vec::new(),
        }
    }

    /// Device channel that stream channel `s` lands on, if `s` is inside
    /// the mapped window.
    pub fn device_channel_for(&self, stream_channel: u16) -> Option<u16> {
        if self.permutation.is_empty() {
            if stream_channel < self.device_channel_count {
                Some(self.device_channel_start + stream_channel)
            } else {
                None
            }
        } else {
            self.permutation.get(stream_channel as usize).copied()
        }
    }

    /// Every device channel this mapping touches.
    pub fn touched_channels(&self) -> Vec<u16> {
        if self.permutation.is_empty() {
            (self.device_channel_start..self.device_channel_start + self.device_channel_count)
                .collect()
        } else {
            self.permutation.clone()
        }
    }

    /// Structural validation: non-empty, inside 0..128, well-formed
    /// permutation (right length, in range, no duplicate targets).
    pub fn validate(&self) -> Result<(), MappingError> {
        if self.stream_channel_count == 0 || self.device_channel_count == 0 {
            return Err(MappingError::EmptyChannelCount);
        }
        let end = self.device_channel_start as usize + self.device_channel_count as usize;
        if end > DEVICE_CHANNELS {
            return Err(MappingError::OutOfRange);
        }
        if !self.permutation.is_empty() {
            if self.permutation.len() != self.stream_channel_count as usize {
                return Err(MappingError::OutOfRange);
            }
            let mut seen = [false; DEVICE_CHANNELS];
            for &d in &self.permutation {
                if d as usize >= DEVICE_CHANNELS || seen[d as usize] {
                    return Err(MappingError::OutOfRange);
                }
                seen[d as usize] = true;
            }
        }
        Ok(())
    }
}

struct MapState {
    forward: HashMap<StreamId, ChannelMapping>,
    reverse: [Option<StreamId>; DEVICE_CHANNELS],
}

impl Default for MapState {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: [None; DEVICE_CHANNELS],
        }
    }
}

impl MapState {
    fn overlaps(&self, mapping: &ChannelMapping, ignore: Option<StreamId>) -> Vec<StreamId> {
        let mut hits = Vec::new();
        for d in mapping.touched_channels() {
            if let Some(owner) = self.reverse[d as usize] {
                if Some(owner) != ignore && !hits.contains(&owner) {
                    hits.push(owner);
                }
            }
        }
        hits
    }

    fn occupy(&mut self, mapping: ChannelMapping) {
        for d in mapping.touched_channels() {
            self.reverse[d as usize] = Some(mapping.stream_id);
        }
        self.forward.insert(mapping.stream_id, mapping);
    }

    fn vacate(&mut self, id: StreamId) -> Option<ChannelMapping> {
        let mapping = self.forward.remove(&id)?;
        for d in mapping.touched_channels() {
            self.reverse[d as usize] = None;
        }
        Some(mapping)
    }
}

/// The 128-slot ownership table.
pub struct ChannelMap {
    state: Mutex<MapState>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MapState::default()),
        }
    }

    /// Admit a new mapping. Fails without side effects on structural
    /// problems, an existing mapping for the same stream, or overlap.
    pub fn add(&self, mapping: ChannelMapping) -> Result<(), MappingError> {
        mapping.validate()?;
        let mut state = self.state.lock();
        if state.forward.contains_key(&mapping.stream_id) {
            return Err(MappingError::Duplicate);
        }
        let hits = state.overlaps(&mapping, None);
        if !hits.is_empty() {
            return Err(MappingError::Overlap(hits));
        }
        state.occupy(mapping);
        Ok(())
    }

    /// Replace a stream's mapping, validating against all *other* mappings
    /// only. Admits the mapping if the stream had none.
    pub fn update(&self, mapping: ChannelMapping) -> Result<(), MappingError> {
        mapping.validate()?;
        let mut state = self.state.lock();
        let hits = state.overlaps(&mapping, Some(mapping.stream_id));
        if !hits.is_empty() {
            return Err(MappingError::Overlap(hits));
        }
        state.vacate(mapping.stream_id);
        state.occupy(mapping);
        Ok(())
    }

    /// Remove a stream's mapping, returning it if present.
    pub fn remove(&self, id: StreamId) -> Option<ChannelMapping> {
        self.state.lock().vacate(id)
    }

    /// Current mapping for a stream.
    pub fn get(&self, id: StreamId) -> Option<ChannelMapping> {
        self.state.lock().forward.get(&id).cloned()
    }

    /// Which stream owns a device channel.
    pub fn owner_of(&self, device_channel: u16) -> Option<StreamId> {
        if device_channel as usize >= DEVICE_CHANNELS {
            return None;
        }
        self.state.lock().reverse[device_channel as usize]
    }

    /// All unowned device channels, ascending.
    pub fn free_channels(&self) -> Vec<u16> {
        let state = self.state.lock();
        (0..DEVICE_CHANNELS as u16)
            .filter(|&d| state.reverse[d as usize].is_none())
            .collect()
    }

    pub fn free_count(&self) -> u16 {
        let state = self.state.lock();
        state.reverse.iter().filter(|slot| slot.is_none()).count() as u16
    }

    /// Lowest start of a free contiguous block of `n` channels.
    pub fn find_contiguous(&self, n: u16) -> Option<u16> {
        if n as usize > DEVICE_CHANNELS {
            return None;
        }
        let state = self.state.lock();
        let mut run_start = 0u16;
        let mut run_len = 0u16;
        for d in 0..DEVICE_CHANNELS as u16 {
            if state.reverse[d as usize].is_none() {
                if run_len == 0 {
                    run_start = d;
                }
                run_len += 1;
                if run_len >= n {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        // n == 0 trivially fits at the lowest slot.
        if n == 0 {
            Some(0)
        } else {
            None
        }
    }

    /// Build (but do not admit) a default identity mapping at the lowest
    /// fitting block.
    pub fn auto_place(&self, id: StreamId, name: &str, n: u16) -> Option<ChannelMapping> {
        let start = self.find_contiguous(n)?;
        Some(ChannelMapping::identity(id, name, start, n))
    }

    /// Snapshot of every live mapping (for persistence and listings).
    pub fn all(&self) -> Vec<ChannelMapping> {
        self.state.lock().forward.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().forward.is_empty()
    }

    /// Forward table and reverse index agreement. Test support.
    #[cfg(test)]
    fn verify_consistency(&self) {
        let state = self.state.lock();
        let mut expect: [Option<StreamId>; DEVICE_CHANNELS] = [None; DEVICE_CHANNELS];
        for mapping in state.forward.values() {
            for d in mapping.touched_channels() {
                assert!(expect[d as usize].is_none(), "channel {d} double-owned");
                expect[d as usize] = Some(mapping.stream_id);
            }
        }
        assert_eq!(expect, state.reverse);
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Mapping snapshot shared between the manager and one worker.
///
/// The manager replaces the snapshot on `update_mapping`; the worker keeps
/// its own `Arc` and reloads only when the epoch counter moves, so the
/// steady-state packet path takes no lock.
pub struct MappingSlot {
    epoch: AtomicU64,
    current: RwLock<Arc<ChannelMapping>>,
}

impl MappingSlot {
    pub fn new(mapping: ChannelMapping) -> Self {
        Self {
            epoch: AtomicU64::new(0),
            current: RwLock::new(Arc::new(mapping)),
        }
    }

    /// Publish a new snapshot.
    pub fn replace(&self, mapping: ChannelMapping) {
        *self.current.write() = Arc::new(mapping);
        self.epoch.fetch_add(1, Ordering::Release);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn load(&self) -> Arc<ChannelMapping> {
        self.current.read().clone()
    }
}
