//! Container manifest: the list of packed entries
//!
//! The manifest is serialized as versioned JSON and stored encrypted at
//! sequence index 0. File entries own one chunk segment each, in manifest
//! order; directory entries only record empty directories and own nothing.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SecarcError, SecarcResult};

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One packed file or empty directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Relative POSIX path, `/`-separated
    pub path: String,
    /// Plaintext size in bytes (0 for directories)
    pub size: u64,
    pub kind: EntryKind,
    /// Position of this file's segment in the chunk stream. Assigned on
    /// build and parse; `None` for directories.
    #[serde(skip)]
    pub ordinal: Option<u64>,
}

impl Entry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            kind: EntryKind::File,
            ordinal: None,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            kind: EntryKind::Directory,
            ordinal: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Number of chunks this entry occupies at the given chunk size.
    pub fn chunk_count(&self, chunk_size: u32) -> u64 {
        match self.kind {
            EntryKind::Directory => 0,
            EntryKind::File => std::cmp::max(1, self.size.div_ceil(u64::from(chunk_size))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    entries: Vec<Entry>,
}

impl Manifest {
    /// Assemble a manifest from entries, validating it the same way a parsed
    /// one is validated.
    pub fn new(entries: Vec<Entry>) -> SecarcResult<Self> {
        let mut manifest = Self {
            version: MANIFEST_VERSION,
            entries,
        };
        manifest.validate()?;
        manifest.assign_ordinals();
        Ok(manifest)
    }

    /// Walk `root` and describe what would be packed.
    ///
    /// A regular file yields one entry named after the file. A directory
    /// yields its files (sorted by relative path) plus its empty
    /// subdirectories. Symlinks are refused; sockets, FIFOs and devices are
    /// skipped with a warning.
    pub fn build(root: &Path) -> SecarcResult<Self> {
        let meta = match std::fs::symlink_metadata(root) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecarcError::SourceNotFound {
                    path: root.to_path_buf(),
                });
            }
            Err(e) => return Err(SecarcError::io(format!("stat {}", root.display()), e)),
        };

        let mut entries = Vec::new();
        if meta.file_type().is_symlink() {
            return Err(symlink_error(root));
        } else if meta.is_file() {
            let name = root
                .file_name()
                .ok_or_else(|| unsupported_name(root))
                .and_then(|n| n.to_str().ok_or_else(|| unsupported_name(root)))?;
            entries.push(Entry::file(name, meta.len()));
        } else if meta.is_dir() {
            walk_dir(root, "", &mut entries)?;
            entries.sort_by(|a, b| a.path.cmp(&b.path));
        } else {
            return Err(SecarcError::io(
                format!("packing {}", root.display()),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "source is neither a regular file nor a directory",
                ),
            ));
        }

        for entry in &entries {
            validate_path(&entry.path).map_err(|_| unsupported_name(Path::new(&entry.path)))?;
        }

        let mut manifest = Self {
            version: MANIFEST_VERSION,
            entries,
        };
        manifest.assign_ordinals();
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> SecarcResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| anyhow::anyhow!("serializing manifest: {e}").into())
    }

    /// Parse and validate a decrypted manifest.
    pub fn from_bytes(bytes: &[u8]) -> SecarcResult<Self> {
        let mut manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| SecarcError::format(format!("malformed manifest: {e}")))?;

        if manifest.version != MANIFEST_VERSION {
            return Err(SecarcError::format(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        manifest.validate()?;
        manifest.assign_ordinals();
        Ok(manifest)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// File entries in chunk-stream order.
    pub fn file_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_file())
    }

    pub fn file_count(&self) -> usize {
        self.file_entries().count()
    }

    pub fn total_size(&self) -> u64 {
        self.file_entries().map(|e| e.size).sum()
    }

    /// Total chunk records the stream must contain at `chunk_size`.
    pub fn chunk_count(&self, chunk_size: u32) -> u64 {
        self.entries.iter().map(|e| e.chunk_count(chunk_size)).sum()
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }

    fn assign_ordinals(&mut self) {
        let mut next = 0u64;
        for entry in &mut self.entries {
            entry.ordinal = match entry.kind {
                EntryKind::File => {
                    next += 1;
                    Some(next - 1)
                }
                EntryKind::Directory => None,
            };
        }
    }

    fn validate(&self) -> SecarcResult<()> {
        let mut kinds: HashMap<&str, EntryKind> = HashMap::with_capacity(self.entries.len());
        for entry in &self.entries {
            validate_path(&entry.path)?;
            if entry.kind == EntryKind::Directory && entry.size != 0 {
                return Err(SecarcError::format(format!(
                    "directory entry {} has nonzero size",
                    entry.path
                )));
            }
            if kinds.insert(&entry.path, entry.kind).is_some() {
                return Err(SecarcError::format(format!(
                    "duplicate manifest entry {}",
                    entry.path
                )));
            }
        }

        // A file cannot also be the parent of another entry.
        let files: HashSet<&str> = kinds
            .iter()
            .filter(|(_, k)| **k == EntryKind::File)
            .map(|(p, _)| *p)
            .collect();
        for entry in &self.entries {
            let mut parent = entry.path.as_str();
            while let Some((head, _)) = parent.rsplit_once('/') {
                if files.contains(head) {
                    return Err(SecarcError::format(format!(
                        "manifest entry {} is nested under file {head}",
                        entry.path
                    )));
                }
                parent = head;
            }
        }
        Ok(())
    }
}

/// Check that `path` is a normalized relative POSIX path.
pub fn validate_path(path: &str) -> SecarcResult<()> {
    let bad = |why: &str| SecarcError::format(format!("invalid entry path {path:?}: {why}"));

    if path.is_empty() {
        return Err(bad("empty"));
    }
    if path.starts_with('/') {
        return Err(bad("absolute"));
    }
    if path.contains('\\') {
        return Err(bad("backslash"));
    }
    if path.contains('\0') {
        return Err(bad("NUL byte"));
    }
    for segment in path.split('/') {
        match segment {
            "" => return Err(bad("empty segment")),
            "." | ".." => return Err(bad("relative segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Returns true if anything was added below `dir`.
fn walk_dir(dir: &Path, prefix: &str, out: &mut Vec<Entry>) -> SecarcResult<bool> {
    let read = std::fs::read_dir(dir)
        .map_err(|e| SecarcError::io(format!("reading dir {}", dir.display()), e))?;

    let mut added = false;
    for entry in read {
        let entry = entry.map_err(|e| SecarcError::io("reading dir entry", e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| SecarcError::io(format!("stat {}", path.display()), e))?;

        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| unsupported_name(&path))?;
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        if file_type.is_symlink() {
            return Err(symlink_error(&path));
        } else if file_type.is_dir() {
            if !walk_dir(&path, &rel, out)? {
                out.push(Entry::directory(rel));
            }
            added = true;
        } else if file_type.is_file() {
            let size = entry
                .metadata()
                .map_err(|e| SecarcError::io(format!("stat {}", path.display()), e))?
                .len();
            out.push(Entry::file(rel, size));
            added = true;
        } else {
            warn!(path = %path.display(), "skipping special file");
        }
    }
    Ok(added)
}

fn symlink_error(path: &Path) -> SecarcError {
    SecarcError::io(
        format!("packing {}", path.display()),
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "symbolic links are not supported",
        ),
    )
}

fn unsupported_name(path: &Path) -> SecarcError {
    SecarcError::io(
        format!("packing {}", path.display()),
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "unsupported file name"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = Manifest::new(vec![
            Entry::file("a.txt", 11),
            Entry::directory("empty"),
            Entry::file("sub/b.txt", 0),
        ])
        .unwrap();

        let bytes = manifest.to_bytes().unwrap();
        let parsed = Manifest::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, manifest);
        assert_eq!(parsed.file_count(), 2);
    }

    #[test]
    fn test_ordinals_skip_directories() {
        let manifest = Manifest::new(vec![
            Entry::directory("a"),
            Entry::file("b", 1),
            Entry::directory("c"),
            Entry::file("d", 1),
        ])
        .unwrap();

        let ordinals: Vec<_> = manifest.entries().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![None, Some(0), None, Some(1)]);
    }

    #[test]
    fn test_ordinal_not_serialized() {
        let manifest = Manifest::new(vec![Entry::file("x", 3)]).unwrap();
        let json = String::from_utf8(manifest.to_bytes().unwrap()).unwrap();
        assert!(!json.contains("ordinal"));
        assert!(json.contains("\"kind\":\"file\""));
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(Entry::file("e", 0).chunk_count(4), 1);
        assert_eq!(Entry::file("e", 4).chunk_count(4), 1);
        assert_eq!(Entry::file("e", 5).chunk_count(4), 2);
        assert_eq!(Entry::directory("d").chunk_count(4), 0);
    }

    #[test]
    fn test_rejects_bad_paths() {
        for path in ["", "/etc/passwd", "../x", "a/../b", "./a", "a//b", "a/", "a\\b", "a\0b"] {
            let json = format!(
                r#"{{"version":1,"entries":[{{"path":{},"size":0,"kind":"file"}}]}}"#,
                serde_json::to_string(path).unwrap()
            );
            let err = Manifest::from_bytes(json.as_bytes()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidContainerFormat, "path {path:?}");
        }
    }

    #[test]
    fn test_rejects_duplicates() {
        let json = br#"{"version":1,"entries":[
            {"path":"a","size":1,"kind":"file"},
            {"path":"a","size":2,"kind":"file"}]}"#;
        assert!(matches!(
            Manifest::from_bytes(json),
            Err(SecarcError::InvalidContainerFormat(_))
        ));
    }

    #[test]
    fn test_rejects_file_as_parent() {
        let result = Manifest::new(vec![Entry::file("a", 1), Entry::file("a/b", 1)]);
        assert!(matches!(result, Err(SecarcError::InvalidContainerFormat(_))));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let json = br#"{"version":2,"entries":[]}"#;
        assert!(matches!(
            Manifest::from_bytes(json),
            Err(SecarcError::InvalidContainerFormat(_))
        ));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Manifest::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_build_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"hello").unwrap();

        let manifest = Manifest::build(&file).unwrap();
        let entries: Vec<_> = manifest.entries().cloned().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "notes.txt");
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[0].ordinal, Some(0));
    }

    #[test]
    fn test_build_tree_sorted_with_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub/deeper")).unwrap();
        std::fs::create_dir_all(root.join("empty/nested")).unwrap();
        std::fs::write(root.join("z.txt"), b"zz").unwrap();
        std::fs::write(root.join("a.txt"), b"hello world").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"").unwrap();

        let manifest = Manifest::build(root).unwrap();
        let listed: Vec<_> = manifest
            .entries()
            .map(|e| (e.path.as_str(), e.size, e.kind))
            .collect();

        assert_eq!(
            listed,
            vec![
                ("a.txt", 11, EntryKind::File),
                ("empty/nested", 0, EntryKind::Directory),
                ("sub/b.txt", 0, EntryKind::File),
                ("sub/deeper", 0, EntryKind::Directory),
                ("z.txt", 2, EntryKind::File),
            ]
        );
    }

    #[test]
    fn test_build_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::build(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceNotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_build_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();

        let err = Manifest::build(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
