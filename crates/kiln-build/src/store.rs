//! Content-addressed local image store.
//!
//! ```text
//! <root>/
//!   blobs/sha256/<hex>   layer tars and image records
//!   images/<tag>         image id the tag points at
//!   tmp/                 staging directories, removed on drop
//!   containers/          unpacked root filesystems for launch
//! ```
//!
//! A blob is never visible under `blobs/` until it is complete: builders
//! write into `tmp/` and [`ImageStore::ingest`] renames it into place.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::image::ImageRecord;
use crate::layer::{digest_bytes, digest_file};

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    /// Open the store at `root`, creating its directories when absent.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [
            store.blobs_dir(),
            store.images_dir(),
            store.tmp_dir(),
            store.containers_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// A fresh staging directory on the same filesystem as the blobs.
    pub fn staging(&self) -> Result<TempDir, StoreError> {
        let tmp = self.tmp_dir();
        tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(&tmp)
            .map_err(|e| StoreError::Io {
                path: tmp,
                source: e,
            })
    }

    /// Path of the blob with `digest`, whether or not it exists.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let hex = digest_hex(digest)?;
        Ok(self.blobs_dir().join(hex))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).is_ok_and(|p| p.is_file())
    }

    /// Move a staged file into the blob directory under `digest`.
    ///
    /// When the blob already exists the staged file is discarded.
    pub fn ingest(&self, staged: &Path, digest: &str) -> Result<PathBuf, StoreError> {
        let target = self.blob_path(digest)?;
        if target.is_file() {
            std::fs::remove_file(staged).map_err(|e| StoreError::Io {
                path: staged.to_path_buf(),
                source: e,
            })?;
            tracing::debug!(%digest, "blob already present");
            return Ok(target);
        }
        std::fs::rename(staged, &target).map_err(|e| StoreError::Io {
            path: target.clone(),
            source: e,
        })?;
        Ok(target)
    }

    /// Store an image record and return its id.
    pub fn write_record(&self, record: &ImageRecord) -> Result<String, StoreError> {
        let bytes = record.to_bytes().map_err(StoreError::Serialize)?;
        let id = digest_bytes(&bytes);
        let target = self.blob_path(&id)?;
        if !target.is_file() {
            write_atomic(&self.tmp_dir(), &target, &bytes)?;
        }
        Ok(id)
    }

    /// Point `tag` at image `id`, replacing any previous target.
    pub fn tag(&self, tag: &str, id: &str) -> Result<(), StoreError> {
        validate_tag(tag)?;
        if !self.has_blob(id) {
            return Err(StoreError::UnknownImage(id.to_owned()));
        }
        let path = self.images_dir().join(tag);
        write_atomic(&self.tmp_dir(), &path, format!("{id}\n").as_bytes())
    }

    /// Resolve a tag or image id to an image id.
    pub fn resolve(&self, name_or_id: &str) -> Result<String, StoreError> {
        if name_or_id.starts_with("sha256:") {
            return if self.has_blob(name_or_id) {
                Ok(name_or_id.to_owned())
            } else {
                Err(StoreError::UnknownImage(name_or_id.to_owned()))
            };
        }
        validate_tag(name_or_id)?;
        let path = self.images_dir().join(name_or_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content.trim().to_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::UnknownImage(name_or_id.to_owned()))
            }
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    /// Load an image record, verifying its content against `id`.
    pub fn load(&self, id: &str) -> Result<ImageRecord, StoreError> {
        let path = self.blob_path(id)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::UnknownImage(id.to_owned()));
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        let actual = digest_bytes(&bytes);
        if actual != id {
            return Err(StoreError::Corrupt {
                digest: id.to_owned(),
                actual,
            });
        }
        ImageRecord::from_bytes(&bytes).map_err(StoreError::Deserialize)
    }

    /// Re-hash a layer blob and compare it with its name.
    pub fn verify_blob(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let path = self.blob_path(digest)?;
        let (actual, _) = digest_file(&path).map_err(|e| StoreError::Layer {
            digest: digest.to_owned(),
            source: e,
        })?;
        if actual != digest {
            return Err(StoreError::Corrupt {
                digest: digest.to_owned(),
                actual,
            });
        }
        Ok(path)
    }

    /// All tags with their image ids, sorted by tag.
    pub fn list(&self) -> Result<Vec<(String, String)>, StoreError> {
        let dir = self.images_dir();
        let read = std::fs::read_dir(&dir).map_err(|e| StoreError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let mut images = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| StoreError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let Some(tag) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let path = entry.path();
            let id = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::Io { path, source: e })?;
            images.push((tag, id.trim().to_owned()));
        }
        images.sort();
        Ok(images)
    }
}

fn digest_hex(digest: &str) -> Result<&str, StoreError> {
    digest
        .strip_prefix("sha256:")
        .filter(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| StoreError::InvalidDigest(digest.to_owned()))
}

fn validate_tag(tag: &str) -> Result<(), StoreError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with('.')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTag(tag.to_owned()))
    }
}

fn write_atomic(tmp_dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut staged = tempfile::NamedTempFile::new_in(tmp_dir).map_err(|e| StoreError::Io {
        path: tmp_dir.to_path_buf(),
        source: e,
    })?;
    staged.write_all(bytes).map_err(|e| StoreError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;
    staged.persist(target).map_err(|e| StoreError::Io {
        path: target.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("image store I/O failed at {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid digest {0:?}: expected sha256:<64 hex chars>")]
    InvalidDigest(String),
    #[error("invalid tag {0:?}: use letters, digits, '.', '_' or '-'")]
    InvalidTag(String),
    #[error("no image named {0}")]
    UnknownImage(String),
    #[error("blob {digest} is corrupt (content hashes to {actual})")]
    Corrupt { digest: String, actual: String },
    #[error("failed to read layer {digest}")]
    Layer {
        digest: String,
        source: crate::layer::LayerError,
    },
    #[error("failed to serialize image record")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to parse image record")]
    Deserialize(#[source] serde_json::Error),
}
