//! Persisted stream configuration.
//!
//! The document is a versioned JSON envelope holding one record per stream
//! (descriptor, mapping, enable flag, timestamps). JSON keys make the form
//! self-describing, so records survive field reordering and unknown trailing
//! fields. Writes go through a temp file and an atomic rename; the writer
//! runs on its own thread and is never touched from realtime code.

use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::descriptor::StreamDescriptor;
use crate::error::PersistError;
use crate::mapping::ChannelMapping;

/// Envelope format version.
pub const FORMAT_VERSION: u32 = 1;

/// One persisted stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStream {
    pub descriptor: StreamDescriptor,
    pub mapping: ChannelMapping,
    pub enabled: bool,
    /// Unix seconds.
    pub created_at: u64,
    pub modified_at: u64,
}

/// The whole on-disk document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    /// Unix seconds at write time.
    pub saved_at: u64,
    pub streams: Vec<PersistedStream>,
}

impl PersistedState {
    pub fn new(streams: Vec<PersistedStream>) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at: unix_now(),
            streams,
        }
    }
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serialize the document.
pub fn encode(state: &PersistedState) -> Result<Vec<u8>, PersistError> {
    serde_json::to_vec_pretty(state).map_err(|e| PersistError::DecodeFailed(e.to_string()))
}

/// Deserialize and version-check the document. Per-record validation is the
/// restorer's job (invalid records are dropped there, not here).
pub fn decode(bytes: &[u8]) -> Result<PersistedState, PersistError> {
    let state: PersistedState =
        serde_json::from_slice(bytes).map_err(|e| PersistError::DecodeFailed(e.to_string()))?;
    if state.version != FORMAT_VERSION {
        return Err(PersistError::DecodeFailed(format!(
            "unsupported config version {}",
            state.version
        )));
    }
    Ok(state)
}

/// Storage boundary supplied by the collaborator. The core decides the
/// bytes, the store decides where they live.
pub trait ConfigStore: Send + Sync {
    fn save(&self, bytes: &[u8], path: &Path) -> io::Result<()>;
    fn load(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Filesystem-backed store with write-to-temp-then-rename atomicity.
pub struct FsStore;

impl ConfigStore for FsStore {
    fn save(&self, bytes: &[u8], path: &Path) -> io::Result<()> {
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn load(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// Background writer. `save_async` hands a snapshot to the worker thread;
/// bursts coalesce so only the latest snapshot hits the disk.
pub struct AutoSaver {
    tx: Option<Sender<PersistedState>>,
    worker: Option<JoinHandle<()>>,
}

impl AutoSaver {
    pub fn spawn(store: Box<dyn ConfigStore>, path: PathBuf) -> Self {
        let (tx, rx) = unbounded::<PersistedState>();
        let worker = thread::Builder::new()
            .name("aes67-persist".to_string())
            .spawn(move || {
                while let Ok(mut state) = rx.recv() {
                    // Coalesce a burst of snapshots into the newest one.
                    while let Ok(newer) = rx.try_recv() {
                        state = newer;
                    }
                    match encode(&state) {
                        Ok(bytes) => {
                            if let Err(e) = store.save(&bytes, &path) {
                                warn!(error = %e, path = %path.display(), "config save failed");
                            } else {
                                debug!(
                                    streams = state.streams.len(),
                                    path = %path.display(),
                                    "config saved"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "config encode failed"),
                    }
                }
            })
            .expect("spawn persister worker");

        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Queue a snapshot for writing. Never blocks.
    pub fn save_async(&self, state: PersistedState) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(state);
        }
    }
}

impl Drop for AutoSaver {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain pending snapshots and
        // exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ChannelMapping;
    use crate::StreamId;

    fn record(name: &str) -> PersistedStream {
        let id = StreamId::generate();
        PersistedStream {
            descriptor: StreamDescriptor {
                session_name: name.into(),
                connection_address: std::net::Ipv4Addr::new(239, 5, 5, 5),
                num_channels: 4,
                ..Default::default()
            },
            mapping: ChannelMapping::identity(id, name, 0, 4),
            enabled: true,
            created_at: 1_700_000_000,
            modified_at: 1_700_000_100,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let state = PersistedState::new(vec![record("a"), record("b")]);
        let bytes = encode(&state).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn decode_survives_field_reordering() {
        let state = PersistedState::new(vec![record("a")]);
        let value: serde_json::Value =
            serde_json::from_slice(&encode(&state).unwrap()).unwrap();
        // Re-emit through a map, which scrambles key order relative to the
        // struct definition.
        let reordered = serde_json::to_vec(&value).unwrap();
        assert_eq!(decode(&reordered).unwrap(), state);
    }

    #[test]
    fn decode_rejects_garbage_and_foreign_versions() {
        assert!(matches!(
            decode(b"not json"),
            Err(PersistError::DecodeFailed(_))
        ));

        let mut state = PersistedState::new(vec![]);
        state.version = 99;
        let bytes = serde_json::to_vec(&state).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(PersistError::DecodeFailed(_))
        ));
    }

    #[test]
    fn fs_store_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.json");
        let store = FsStore;

        store.save(b"first", &path).unwrap();
        store.save(b"second", &path).unwrap();
        assert_eq!(store.load(&path).unwrap(), b"second");
        // No temp file left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn autosaver_writes_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.json");

        let saver = AutoSaver::spawn(Box::new(FsStore), path.clone());
        saver.save_async(PersistedState::new(vec![]));
        saver.save_async(PersistedState::new(vec![record("final")]));
        drop(saver); // joins the worker, flushing the queue

        let state = decode(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(state.streams.len(), 1);
        assert_eq!(state.streams[0].descriptor.session_name, "final");
    }
}
