//! Fingerprint persistence.
//!
//! The engine talks to a [`FingerprintStore`], which keeps the most recent
//! fingerprint of every task in memory and delegates to a [`Persistence`]
//! backend. Only the last fingerprint per task is kept.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::sync::{Mutex, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::{Hash32, TaskId};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

/// Storage medium for fingerprints. The engine does not care where they go.
pub trait Persistence: Send + Sync {
    fn load(&self, id: &TaskId) -> Result<Option<Fingerprint>, StoreError>;
    fn save(&self, id: &TaskId, fingerprint: &Fingerprint) -> Result<(), StoreError>;
}

/// Keeps fingerprints for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryPersistence {
    map: Mutex<HashMap<TaskId, Fingerprint>>,
}

impl Persistence for MemoryPersistence {
    fn load(&self, id: &TaskId) -> Result<Option<Fingerprint>, StoreError> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(id).cloned())
    }

    fn save(&self, id: &TaskId, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(id.clone(), fingerprint.clone());
        Ok(())
    }
}

/// One CBOR file per task inside a cache directory, named after the hash of
/// the task id.
pub struct DiskPersistence {
    dir: Utf8PathBuf,
}

impl DiskPersistence {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn path(&self, id: &TaskId) -> Utf8PathBuf {
        let name = Hash32::hash(id.as_str()).to_hex();
        self.dir.join(name).with_extension("cbor")
    }
}

impl Persistence for DiskPersistence {
    fn load(&self, id: &TaskId) -> Result<Option<Fingerprint>, StoreError> {
        let file = match File::open(self.path(id)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        ciborium::from_reader(BufReader::new(file))
            .map(Some)
            .map_err(|e| StoreError::Decode(id.clone(), e.to_string()))
    }

    fn save(&self, id: &TaskId, fingerprint: &Fingerprint) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        // Write aside and rename, a crash never leaves a torn file behind.
        let path = self.path(id);
        let temp = path.with_extension("cbor.tmp");

        let mut writer = BufWriter::new(File::create(&temp)?);
        ciborium::into_writer(fingerprint, &mut writer)
            .map_err(|e| StoreError::Encode(id.clone(), e.to_string()))?;
        writer.flush()?;
        drop(writer);
        fs::rename(&temp, &path)?;

        Ok(())
    }
}

/// Last known fingerprint of every task.
pub struct FingerprintStore {
    backend: Box<dyn Persistence>,
    cache: RwLock<HashMap<TaskId, Option<Fingerprint>>>,
}

impl FingerprintStore {
    pub fn new(backend: impl Persistence + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryPersistence::default())
    }

    pub fn on_disk(dir: impl Into<Utf8PathBuf>) -> Self {
        Self::new(DiskPersistence::new(dir))
    }

    /// The last recorded fingerprint of `id`, if any.
    ///
    /// A fingerprint which can't be read counts as no history, so the task
    /// simply runs again.
    pub fn previous(&self, id: &TaskId) -> Option<Fingerprint> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(id) {
                return entry.clone();
            }
        }

        let loaded = match self.backend.load(id) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!("discarding fingerprint of {}: {}", id, e);
                None
            }
        };

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(id.clone(), loaded.clone());
        loaded
    }

    /// Replaces the fingerprint of `id`.
    pub fn record(&self, id: &TaskId, fingerprint: Fingerprint) -> Result<(), StoreError> {
        let saved = self.backend.save(id, &fingerprint);

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(id.clone(), Some(fingerprint));

        saved
    }
}

impl Default for FingerprintStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Signature;

    fn fingerprint(seed: &str) -> Fingerprint {
        let mut fp = Fingerprint::default();
        fp.inputs.insert(
            "src".into(),
            Signature {
                hash: Hash32::hash(seed),
                complete: true,
            },
        );
        fp.properties.insert("flag".into(), Hash32::of(&true));
        fp
    }

    #[test]
    fn test_memory_round_trip() {
        let store = FingerprintStore::in_memory();
        let id = TaskId::from("compile");

        assert_eq!(store.previous(&id), None);

        store.record(&id, fingerprint("a")).unwrap();
        assert_eq!(store.previous(&id), Some(fingerprint("a")));

        store.record(&id, fingerprint("b")).unwrap();
        assert_eq!(store.previous(&id), Some(fingerprint("b")));
    }

    #[test]
    fn test_disk_survives_new_store() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().join("cache")).unwrap();
        let id = TaskId::from(":app:compile/../weird id");

        FingerprintStore::on_disk(&dir)
            .record(&id, fingerprint("x"))
            .unwrap();

        let store = FingerprintStore::on_disk(&dir);
        assert_eq!(store.previous(&id), Some(fingerprint("x")));
        assert_eq!(store.previous(&TaskId::from("other")), None);
    }

    #[test]
    fn test_corrupt_file_counts_as_no_history() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let backend = DiskPersistence::new(&dir);
        let id = TaskId::from("broken");

        fs::write(backend.path(&id), [0xffu8, 0xff, 0xff]).unwrap();
        assert!(backend.load(&id).is_err());

        let store = FingerprintStore::new(backend);
        assert_eq!(store.previous(&id), None);
    }
}
