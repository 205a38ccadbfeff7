//! Local store adapter: the on-disk file namespace under one root.
//!
//! Paths are forward-slash-normalized and root-relative. Validation is
//! by component-wise resolution: a path never leaves the root because
//! escaping components are rejected before any filesystem call.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorKind;

/// Windows device names that shadow real files; rejected everywhere so
/// a namespace replicates identically across platforms.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const DEFAULT_IO_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("invalid path: {path}")]
    InvalidPath { path: String },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("already exists: {path}")]
    Exists { path: String },
    #[error("is a directory: {path}")]
    IsDirectory { path: String },
    #[error("not a directory: {path}")]
    NotADirectory { path: String },
    #[error("directory not empty: {path}")]
    NotEmpty { path: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl VfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VfsError::InvalidPath { .. } | VfsError::NotADirectory { .. } => ErrorKind::InvalidPath,
            VfsError::NotFound { .. } => ErrorKind::NotFound,
            VfsError::Exists { .. } => ErrorKind::Exists,
            VfsError::IsDirectory { .. } => ErrorKind::IsDirectory,
            VfsError::NotEmpty { .. } | VfsError::Io { .. } => ErrorKind::WriteFailed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Clone, Debug, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: f64,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StoreStats {
    pub total_files: u64,
    pub total_dirs: u64,
    pub total_size: u64,
}

pub struct LocalStore {
    root: PathBuf,
    io_chunk: usize,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, VfsError> {
        Self::open_with_chunk(root, DEFAULT_IO_CHUNK)
    }

    pub fn open_with_chunk(root: impl Into<PathBuf>, io_chunk: usize) -> Result<Self, VfsError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| VfsError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self {
            root,
            io_chunk: io_chunk.max(8 * 1024),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a namespace path to a real path under the root.
    /// Absolute paths, `..` segments, and reserved device names are
    /// rejected structurally, before any filesystem call.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, VfsError> {
        if path.is_empty() {
            return Err(VfsError::InvalidPath {
                path: path.to_string(),
            });
        }
        self.resolve_inner(path)
    }

    /// Like `resolve`, but "" and "/" name the root itself (for `list`).
    fn resolve_dir(&self, path: &str) -> Result<PathBuf, VfsError> {
        if path.is_empty() || path == "/" {
            return Ok(self.root.clone());
        }
        self.resolve_inner(path)
    }

    fn resolve_inner(&self, trimmed: &str) -> Result<PathBuf, VfsError> {
        let mut resolved = self.root.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => {
                    let segment = segment.to_str().ok_or_else(|| VfsError::InvalidPath {
                        path: trimmed.to_string(),
                    })?;
                    if segment.contains('\\') || is_reserved_name(segment) {
                        return Err(VfsError::InvalidPath {
                            path: trimmed.to_string(),
                        });
                    }
                    resolved.push(segment);
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(VfsError::InvalidPath {
                        path: trimmed.to_string(),
                    });
                }
            }
        }
        Ok(resolved)
    }

    /// Creates an empty regular file. Fails if the path already exists.
    pub fn create(&self, path: &str) -> Result<(), VfsError> {
        let abs = self.resolve(path)?;
        ensure_parent(&abs, path)?;
        match fs::OpenOptions::new().write(true).create_new(true).open(&abs) {
            Ok(_) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(VfsError::Exists {
                    path: path.to_string(),
                })
            }
            Err(source) => Err(VfsError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Overwrite-or-create. Returns the new size in bytes.
    pub fn write(&self, path: &str, bytes: &[u8]) -> Result<u64, VfsError> {
        let abs = self.resolve(path)?;
        if abs.is_dir() {
            return Err(VfsError::IsDirectory {
                path: path.to_string(),
            });
        }
        ensure_parent(&abs, path)?;
        fs::write(&abs, bytes).map_err(|source| VfsError::Io {
            path: path.to_string(),
            source,
        })?;
        Ok(bytes.len() as u64)
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let abs = self.resolve(path)?;
        if abs.is_dir() {
            return Err(VfsError::IsDirectory {
                path: path.to_string(),
            });
        }
        fs::read(&abs).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => VfsError::NotFound {
                path: path.to_string(),
            },
            _ => VfsError::Io {
                path: path.to_string(),
                source,
            },
        })
    }

    /// Removes a file or an empty directory. Missing paths are fine.
    pub fn delete(&self, path: &str) -> Result<(), VfsError> {
        let abs = self.resolve(path)?;
        let meta = match fs::symlink_metadata(&abs) {
            Ok(meta) => meta,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(VfsError::Io {
                    path: path.to_string(),
                    source,
                });
            }
        };
        let result = if meta.is_dir() {
            fs::remove_dir(&abs)
        } else {
            fs::remove_file(&abs)
        };
        match result {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) if meta.is_dir() && source.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                Err(VfsError::NotEmpty {
                    path: path.to_string(),
                })
            }
            Err(source) => Err(VfsError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Recursive and idempotent.
    pub fn mkdir(&self, path: &str) -> Result<(), VfsError> {
        let abs = self.resolve(path)?;
        fs::create_dir_all(&abs).map_err(|source| VfsError::Io {
            path: path.to_string(),
            source,
        })
    }

    pub fn size(&self, path: &str) -> Result<u64, VfsError> {
        let abs = self.resolve(path)?;
        match fs::metadata(&abs) {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Ok(0),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(VfsError::NotFound {
                    path: path.to_string(),
                })
            }
            Err(source) => Err(VfsError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|abs| abs.exists()).unwrap_or(false)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).map(|abs| abs.is_dir()).unwrap_or(false)
    }

    /// Immediate children, directories first, then by name.
    pub fn list(&self, path: &str) -> Result<Vec<DirEntryInfo>, VfsError> {
        let abs = self.resolve_dir(path)?;
        if !abs.exists() {
            return Err(VfsError::NotFound {
                path: path.to_string(),
            });
        }
        if !abs.is_dir() {
            return Err(VfsError::NotADirectory {
                path: path.to_string(),
            });
        }
        let entries = fs::read_dir(&abs).map_err(|source| VfsError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut items = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| VfsError::Io {
                path: path.to_string(),
                source,
            })?;
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            items.push(DirEntryInfo {
                name,
                kind: if meta.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                size: if meta.is_file() { meta.len() } else { 0 },
                modified: system_time_secs(meta.modified().ok()),
            });
        }
        items.sort_by(|a, b| {
            (a.kind != EntryKind::Dir)
                .cmp(&(b.kind != EntryKind::Dir))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(items)
    }

    /// Full SHA-256 hex of the file body; directories hash to "".
    pub fn hash(&self, path: &str) -> Result<String, VfsError> {
        let abs = self.resolve(path)?;
        if abs.is_dir() {
            return Ok(String::new());
        }
        let mut file = fs::File::open(&abs).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => VfsError::NotFound {
                path: path.to_string(),
            },
            _ => VfsError::Io {
                path: path.to_string(),
                source,
            },
        })?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.io_chunk];
        loop {
            let n = file.read(&mut buf).map_err(|source| VfsError::Io {
                path: path.to_string(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// All regular files under the root, '/'-separated and sorted.
    pub fn walk(&self) -> Result<Vec<String>, VfsError> {
        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir).map_err(|source| VfsError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| VfsError::Io {
                    path: dir.display().to_string(),
                    source,
                })?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.is_file()
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    stats.total_dirs += 1;
                    stack.push(entry.path());
                } else if meta.is_file() {
                    stats.total_files += 1;
                    stats.total_size += meta.len();
                }
            }
        }
        stats
    }
}

/// SHA-256 hex of an in-memory body; the same digest `hash` computes
/// from disk.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn is_reserved_name(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment);
    RESERVED_NAMES
        .iter()
        .any(|name| stem.eq_ignore_ascii_case(name))
}

fn ensure_parent(abs: &Path, path: &str) -> Result<(), VfsError> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).map_err(|source| VfsError::Io {
            path: path.to_string(),
            source,
        })?;
    }
    Ok(())
}

fn system_time_secs(time: Option<std::time::SystemTime>) -> f64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::open(dir.path().join("root")).expect("open");
        (dir, store)
    }

    #[test]
    fn create_write_read_roundtrip() {
        let (_dir, store) = store();
        store.create("docs/a.txt").unwrap();
        store.write("docs/a.txt", b"hello").unwrap();
        assert_eq!(store.read("docs/a.txt").unwrap(), b"hello");
    }

    #[test]
    fn create_fails_on_existing() {
        let (_dir, store) = store();
        store.create("a.txt").unwrap();
        assert!(matches!(
            store.create("a.txt").unwrap_err(),
            VfsError::Exists { .. }
        ));
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read("ghost.txt").unwrap_err(),
            VfsError::NotFound { .. }
        ));
    }

    #[test]
    fn read_directory_is_rejected() {
        let (_dir, store) = store();
        store.mkdir("sub").unwrap();
        let err = store.read("sub").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IsDirectory);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.write("a.txt", b"x").unwrap();
        store.delete("a.txt").unwrap();
        store.delete("a.txt").unwrap();
        assert!(!store.exists("a.txt"));
    }

    #[test]
    fn delete_refuses_nonempty_directory() {
        let (_dir, store) = store();
        store.write("sub/a.txt", b"x").unwrap();
        assert!(store.delete("sub").is_err());
        store.delete("sub/a.txt").unwrap();
        store.delete("sub").unwrap();
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let (_dir, store) = store();
        for path in ["../evil", "a/../../evil", "/etc/passwd", "..", ""] {
            let err = store.resolve(path).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidPath, "path {path:?}");
        }
        // Interior `..` that still stays below the root is also refused;
        // enforcement is structural, not string matching.
        assert!(store.resolve("a/../b").is_err());
    }

    #[test]
    fn reserved_device_names_are_rejected() {
        let (_dir, store) = store();
        for path in ["CON", "con.txt", "sub/NUL", "COM1.log", "lpt9"] {
            assert!(store.resolve(path).is_err(), "path {path:?}");
        }
        assert!(store.resolve("console.txt").is_ok());
    }

    #[test]
    fn list_sorts_directories_first() {
        let (_dir, store) = store();
        store.write("b.txt", b"b").unwrap();
        store.write("a.txt", b"a").unwrap();
        store.mkdir("zdir").unwrap();
        let items = store.list("").unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "a.txt", "b.txt"]);
    }

    #[test]
    fn hash_matches_in_memory_digest() {
        let (_dir, store) = store();
        store.write("a.txt", b"hello").unwrap();
        assert_eq!(store.hash("a.txt").unwrap(), sha256_hex(b"hello"));
        store.mkdir("d").unwrap();
        assert_eq!(store.hash("d").unwrap(), "");
    }

    #[test]
    fn walk_lists_nested_files() {
        let (_dir, store) = store();
        store.write("a.txt", b"1").unwrap();
        store.write("sub/deep/b.txt", b"2").unwrap();
        assert_eq!(store.walk().unwrap(), vec!["a.txt", "sub/deep/b.txt"]);
    }

    #[test]
    fn stats_counts_files_and_bytes() {
        let (_dir, store) = store();
        store.write("a.txt", b"12345").unwrap();
        store.write("sub/b.txt", b"123").unwrap();
        let stats = store.stats();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_dirs, 1);
        assert_eq!(stats.total_size, 8);
    }
}
