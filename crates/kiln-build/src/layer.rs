//! Deterministic layer archives.
//!
//! A layer is an uncompressed tar whose bytes depend only on the paths,
//! contents, symlink targets and executable bits of its entries: entries are
//! sorted, owners are root, mtimes are zero and modes are normalised.
//! Building the same tree twice yields the same digest.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::tree::{EntryKind, TreeEntry};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;
const LINK_MODE: u32 = 0o777;

#[derive(Debug, Clone)]
enum Entry {
    Dir,
    File { source: PathBuf, executable: bool },
    Symlink { target: PathBuf },
}

/// Collects entries keyed by their path inside the image, then writes them
/// as one tar.
#[derive(Debug, Default)]
pub struct LayerBuilder {
    entries: BTreeMap<PathBuf, Entry>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `image_path` and all of its ancestors as directories.
    pub fn add_dir(&mut self, image_path: &Path) {
        let mut current = PathBuf::new();
        for component in image_path.components() {
            current.push(component);
            self.entries.entry(current.clone()).or_insert(Entry::Dir);
        }
    }

    pub fn add_file(&mut self, source: &Path, image_path: &Path, executable: bool) {
        if let Some(parent) = image_path.parent() {
            self.add_dir(parent);
        }
        self.entries.insert(
            image_path.to_path_buf(),
            Entry::File {
                source: source.to_path_buf(),
                executable,
            },
        );
    }

    /// Adds a collected tree below `image_root`.
    pub fn add_tree(&mut self, tree: &[TreeEntry], image_root: &Path) {
        self.add_dir(image_root);
        for entry in tree {
            let image_path = image_root.join(&entry.relative);
            match &entry.kind {
                EntryKind::Dir => self.add_dir(&image_path),
                EntryKind::File { executable } => {
                    self.add_file(&entry.source, &image_path, *executable)
                }
                EntryKind::Symlink { target } => {
                    if let Some(parent) = image_path.parent() {
                        self.add_dir(parent);
                    }
                    self.entries.insert(
                        image_path,
                        Entry::Symlink {
                            target: target.clone(),
                        },
                    );
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the layer to `out` and returns its digest.
    pub fn write(self, out: &Path) -> Result<LayerBlob, LayerError> {
        let write_err = |e| LayerError::Write {
            path: out.to_path_buf(),
            source: e,
        };

        let file = File::create(out).map_err(write_err)?;
        let mut archive = tar::Builder::new(BufWriter::new(file));

        for (path, entry) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);

            match entry {
                Entry::Dir => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(DIR_MODE);
                    header.set_size(0);
                    archive
                        .append_data(&mut header, path, std::io::empty())
                        .map_err(write_err)?;
                }
                Entry::File { source, executable } => {
                    let file = File::open(source).map_err(|e| LayerError::Read {
                        path: source.clone(),
                        source: e,
                    })?;
                    let len = file
                        .metadata()
                        .map_err(|e| LayerError::Read {
                            path: source.clone(),
                            source: e,
                        })?
                        .len();
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(if *executable { EXEC_MODE } else { FILE_MODE });
                    header.set_size(len);
                    archive
                        .append_data(&mut header, path, file)
                        .map_err(write_err)?;
                }
                Entry::Symlink { target } => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(LINK_MODE);
                    header.set_size(0);
                    archive
                        .append_link(&mut header, path, target)
                        .map_err(write_err)?;
                }
            }
        }

        let mut writer = archive.into_inner().map_err(write_err)?;
        writer.flush().map_err(write_err)?;
        drop(writer);

        let (digest, size) = digest_file(out)?;
        tracing::debug!(path = %out.display(), %digest, size, "wrote layer");

        Ok(LayerBlob {
            path: out.to_path_buf(),
            digest,
            size,
        })
    }
}

/// A layer written to disk but not yet moved into the store.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub path: PathBuf,
    pub digest: String,
    pub size: u64,
}

/// SHA-256 of a file as `sha256:<hex>`, plus its size.
pub fn digest_file(path: &Path) -> Result<(String, u64), LayerError> {
    let read_err = |e| LayerError::Read {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = File::open(path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher).map_err(read_err)?;
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

/// SHA-256 of a byte slice as `sha256:<hex>`.
pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write layer {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}
