use std::borrow::Borrow;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing and change detection.
///
/// In `kiln`, this serves two primary purposes:
/// 1. It is the signature of every fingerprinted collection, property and
///    upstream output, so two snapshots of identical state compare equal.
/// 2. It names persisted fingerprint files on disk, so arbitrary task ids map
///    to safe file names.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash32(pub(crate) [u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    /// Hashes any value implementing [`std::hash::Hash`] through BLAKE3.
    pub fn of<T: std::hash::Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Streaming BLAKE3 hasher that also works as a [`std::hash::Hasher`], so
/// anything `Hash` can be folded into a signature.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Length-prefixed write, keeps `("ab", "c")` apart from `("a", "bc")`.
    pub(crate) fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Unique, stable identifier of a task within a graph.
///
/// Cloning is cheap, the string is shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.into())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        TaskId(value.into())
    }
}

impl From<&TaskId> for TaskId {
    fn from(value: &TaskId) -> Self {
        value.clone()
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// What the engine does once a task action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop admitting new work after the first failure, let running actions
    /// finish.
    #[default]
    FailFast,
    /// Keep running every branch that does not depend on a failed task.
    Continue,
}

/// Engine configuration.
///
/// Every field has a default, so a partial document deserializes fine. How
/// the document is found and parsed is up to the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Size of the worker pool, `0` picks the available parallelism.
    pub workers: usize,
    /// Failure propagation mode.
    pub failure: FailurePolicy,
    /// Treat every task as out of date.
    pub rerun: bool,
    /// Directory used by [`DiskPersistence`](crate::store::DiskPersistence).
    pub cache_dir: Utf8PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 0,
            failure: FailurePolicy::default(),
            rerun: false,
            cache_dir: Utf8PathBuf::from(".cache/kiln"),
        }
    }
}

impl Settings {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.failure = FailurePolicy::FailFast;
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.failure = FailurePolicy::Continue;
        self
    }

    pub fn rerun(mut self, rerun: bool) -> Self {
        self.rerun = rerun;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Number of worker threads the engine will actually spawn.
    pub fn effective_workers(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex() {
        let hash = Hash32::hash(b"kiln");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(Hash32::hash(b"kiln"), hash);
    }

    #[test]
    fn test_field_is_length_prefixed() {
        let mut a = Blake3Hasher::default();
        a.field(b"ab").field(b"c");
        let mut b = Blake3Hasher::default();
        b.field(b"a").field(b"bc");
        assert_ne!(Hash32::from(a), Hash32::from(b));
    }

    #[test]
    fn test_settings_partial() {
        let settings: Settings = serde_json::from_str(r#"{"workers": 3}"#).unwrap();
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.failure, FailurePolicy::FailFast);
        assert_eq!(settings.cache_dir, ".cache/kiln");
        assert_eq!(settings.effective_workers(), 3);

        let settings: Settings = serde_json::from_str(r#"{"failure": "continue"}"#).unwrap();
        assert_eq!(settings.failure, FailurePolicy::Continue);
        assert!(settings.effective_workers() >= 1);
    }
}
