//! Content fingerprints of declared inputs, outputs and properties.
//!
//! Every collection is reduced to a single BLAKE3 [`Signature`]. Files are
//! hashed by content, directories recursively by relative path and content,
//! globs by the sorted list of matches. Sizes and modification times are
//! never consulted, so touching a file without changing it does not cause a
//! rebuild, while any content change always does.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::SnapshotError;
use crate::task::{Collections, Location, TaskNode};

/// Signature of one named collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub hash: Hash32,
    /// `false` when a declared file or directory did not exist.
    pub complete: bool,
}

/// Everything recorded about a task after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub inputs: BTreeMap<String, Signature>,
    pub properties: BTreeMap<String, Hash32>,
    /// Output signature of each dependency, keyed by the dependency id.
    pub upstream: BTreeMap<String, Hash32>,
    pub outputs: BTreeMap<String, Signature>,
}

impl Fingerprint {
    /// Captures the pre-execution part of a fingerprint: inputs, properties
    /// and the output signatures of the dependencies.
    pub fn capture(
        node: &TaskNode,
        upstream: BTreeMap<String, Hash32>,
    ) -> Result<Self, SnapshotError> {
        let properties = node
            .properties
            .iter()
            .map(|(name, property)| (name.clone(), property()))
            .collect();

        Ok(Self {
            inputs: snapshot(&node.inputs)?,
            properties,
            upstream,
            outputs: BTreeMap::new(),
        })
    }

    /// Replaces the output part with the current state of the outputs.
    pub fn with_outputs(mut self, node: &TaskNode) -> Result<Self, SnapshotError> {
        self.outputs = snapshot(&node.outputs)?;
        Ok(self)
    }

    /// Single hash over all outputs, used as the upstream entry of every
    /// dependent.
    pub fn output_signature(&self) -> Hash32 {
        signature_of(&self.outputs)
    }
}

/// Combined hash of a set of named signatures.
pub fn signature_of(signatures: &BTreeMap<String, Signature>) -> Hash32 {
    let mut hasher = Blake3Hasher::default();

    for (name, signature) in signatures {
        hasher
            .field(name.as_bytes())
            .update(&signature.hash.0)
            .update(&[signature.complete as u8]);
    }

    hasher.into()
}

/// Takes a snapshot of every collection.
pub fn snapshot(collections: &Collections) -> Result<BTreeMap<String, Signature>, SnapshotError> {
    collections
        .iter()
        .map(|(name, locations)| Ok((name.to_string(), snapshot_collection(locations)?)))
        .collect()
}

fn snapshot_collection(locations: &[Location]) -> Result<Signature, SnapshotError> {
    let mut hasher = Blake3Hasher::default();
    let mut complete = true;

    for location in locations {
        match location {
            Location::File(path) => {
                hasher.field(b"file").field(path.as_str().as_bytes());
                match hash_file(path)? {
                    Some(hash) => hasher.update(&hash.0),
                    None => {
                        complete = false;
                        hasher.field(b"missing")
                    }
                };
            }
            Location::Dir(path) => {
                hasher.field(b"dir").field(path.as_str().as_bytes());
                match list_dir(path)? {
                    Some(tree) => hash_tree(&mut hasher, path, &tree)?,
                    None => {
                        complete = false;
                        hasher.field(b"missing");
                    }
                }
            }
            Location::Glob(pattern) => {
                hasher.field(b"glob").field(pattern.as_bytes());
                let mut files = Vec::new();
                for entry in glob::glob(pattern)? {
                    let path = Utf8PathBuf::try_from(entry?)?;
                    if path.is_file() {
                        files.push(path);
                    }
                }
                files.sort();
                hash_files(&mut hasher, Utf8Path::new(""), &files)?;
            }
            Location::Value(value) => {
                hasher.field(b"value").field(value.as_bytes());
            }
        }
    }

    Ok(Signature {
        hash: hasher.into(),
        complete,
    })
}

/// Content hash of a file, `None` if it does not exist.
fn hash_file(path: &Utf8Path) -> Result<Option<Hash32>, SnapshotError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let tree = list_dir(path)?.unwrap_or_default();
            let mut hasher = Blake3Hasher::default();
            hash_tree(&mut hasher, path, &tree)?;
            Ok(Some(hasher.into()))
        }
        // Memory mapping an empty file fails on some platforms.
        Ok(meta) if meta.len() == 0 => Ok(Some(Hash32::hash(b""))),
        Ok(_) => Hash32::hash_file(path)
            .map(Some)
            .map_err(|e| SnapshotError::FileSystem(path.to_owned(), e)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SnapshotError::FileSystem(path.to_owned(), e)),
    }
}

/// Folds `files` into `hasher`, hashing file contents in parallel.
fn hash_files(
    hasher: &mut Blake3Hasher,
    base: &Utf8Path,
    files: &[Utf8PathBuf],
) -> Result<(), SnapshotError> {
    let hashes = files
        .par_iter()
        .map(|file| hash_file(file).map(|hash| hash.unwrap_or_default()))
        .collect::<Result<Vec<_>, _>>()?;

    for (file, hash) in files.iter().zip(hashes) {
        let relative = file.strip_prefix(base).unwrap_or(file);
        hasher.field(relative.as_str().as_bytes()).update(&hash.0);
    }

    Ok(())
}

/// Subdirectories and files found below a directory.
#[derive(Default)]
struct Tree {
    dirs: Vec<Utf8PathBuf>,
    files: Vec<Utf8PathBuf>,
}

/// Directory layout first, so an empty subdirectory is still seen, then
/// file contents.
fn hash_tree(
    hasher: &mut Blake3Hasher,
    base: &Utf8Path,
    tree: &Tree,
) -> Result<(), SnapshotError> {
    hasher.field(&(tree.dirs.len() as u64).to_le_bytes());
    for dir in &tree.dirs {
        let relative = dir.strip_prefix(base).unwrap_or(dir);
        hasher.field(relative.as_str().as_bytes());
    }

    hash_files(hasher, base, &tree.files)
}

/// Everything below `dir`, sorted. `None` if the directory does not exist.
fn list_dir(dir: &Utf8Path) -> Result<Option<Tree>, SnapshotError> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut tree = Tree::default();
    walk(dir, &mut tree)?;
    tree.dirs.sort();
    tree.files.sort();

    Ok(Some(tree))
}

fn walk(dir: &Utf8Path, tree: &mut Tree) -> Result<(), SnapshotError> {
    let entries = dir
        .read_dir_utf8()
        .map_err(|e| SnapshotError::FileSystem(dir.to_owned(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| SnapshotError::FileSystem(dir.to_owned(), e))?;
        let filetype = entry
            .file_type()
            .map_err(|e| SnapshotError::FileSystem(entry.path().to_owned(), e))?;

        if filetype.is_dir() {
            walk(entry.path(), tree)?;
            tree.dirs.push(entry.into_path());
        } else {
            tree.files.push(entry.into_path());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
    }

    fn collections(name: &str, location: Location) -> Collections {
        let mut c = Collections::default();
        c.push(name, location);
        c
    }

    #[test]
    fn test_file_content_changes_signature() {
        let dir = tempfile::tempdir().unwrap();
        let file = utf8(&dir).join("a.txt");
        fs::write(&file, "one").unwrap();

        let decl = collections("src", Location::File(file.clone()));
        let first = snapshot(&decl).unwrap();
        assert_eq!(first, snapshot(&decl).unwrap());
        assert!(first["src"].complete);

        fs::write(&file, "two").unwrap();
        assert_ne!(first, snapshot(&decl).unwrap());
    }

    #[test]
    fn test_missing_file_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let decl = collections("out", Location::File(utf8(&dir).join("nope")));
        let snap = snapshot(&decl).unwrap();
        assert!(!snap["out"].complete);
    }

    #[test]
    fn test_directory_tracks_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(&dir);
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/c.txt"), "c").unwrap();
        fs::write(root.join("a/d.txt"), "d").unwrap();

        let decl = collections("tree", Location::Dir(root.join("a")));
        let first = snapshot(&decl).unwrap();

        fs::write(root.join("a/b/new.txt"), "").unwrap();
        let second = snapshot(&decl).unwrap();
        assert_ne!(first, second);

        fs::remove_file(root.join("a/b/new.txt")).unwrap();
        assert_eq!(first, snapshot(&decl).unwrap());
    }

    #[test]
    fn test_directory_tracks_empty_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(&dir);
        fs::create_dir_all(root.join("out")).unwrap();
        fs::write(root.join("out/report.txt"), "ok").unwrap();

        let decl = collections("out", Location::Dir(root.join("out")));
        let first = snapshot(&decl).unwrap();

        fs::create_dir_all(root.join("out/generated")).unwrap();
        let second = snapshot(&decl).unwrap();
        assert_ne!(first, second);
        assert!(second["out"].complete);

        fs::remove_dir(root.join("out/generated")).unwrap();
        assert_eq!(first, snapshot(&decl).unwrap());
    }

    #[test]
    fn test_glob_matches() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(&dir);
        fs::write(root.join("x.rs"), "x").unwrap();
        fs::write(root.join("y.md"), "y").unwrap();

        let decl = collections("rs", Location::Glob(format!("{root}/*.rs")));
        let first = snapshot(&decl).unwrap();

        fs::write(root.join("y.md"), "changed").unwrap();
        assert_eq!(first, snapshot(&decl).unwrap());

        fs::write(root.join("z.rs"), "z").unwrap();
        assert_ne!(first, snapshot(&decl).unwrap());
    }

    #[test]
    fn test_value_and_output_signature() {
        let a = collections("v", Location::Value("1".into()));
        let b = collections("v", Location::Value("2".into()));
        let a = snapshot(&a).unwrap();
        let b = snapshot(&b).unwrap();
        assert_ne!(signature_of(&a), signature_of(&b));

        let fingerprint = Fingerprint {
            outputs: a.clone(),
            ..Default::default()
        };
        assert_eq!(fingerprint.output_signature(), signature_of(&a));
    }
}
