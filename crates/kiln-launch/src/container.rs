use std::fs::File;
use std::path::{Path, PathBuf};

use kiln_build::{ImageRecord, ImageStore, StoreError};
use kiln_core::WorkDir;
use tempfile::TempDir;

/// An image's layers unpacked into a private root filesystem.
///
/// The root lives under the store's `containers/` directory and is removed
/// when the container is dropped.
#[derive(Debug)]
pub struct Container {
    id: String,
    record: ImageRecord,
    workdir: WorkDir,
    root: TempDir,
}

impl Container {
    /// Unpack image `id` (a tag or image id) from `store`.
    pub fn create(store: &ImageStore, image: &str) -> Result<Self, ContainerError> {
        let id = store.resolve(image)?;
        let record = store.load(&id)?;
        let workdir = WorkDir::new(&record.workdir).map_err(ContainerError::InvalidRecord)?;

        let containers = store.containers_dir();
        let short = id.trim_start_matches("sha256:").get(..12).unwrap_or("image");
        let root = tempfile::Builder::new()
            .prefix(&format!("{short}-"))
            .tempdir_in(&containers)
            .map_err(|e| ContainerError::Create {
                path: containers.clone(),
                source: e,
            })?;

        for layer in &record.layers {
            let blob = store.verify_blob(&layer.digest)?;
            unpack_layer(&blob, root.path()).map_err(|e| ContainerError::Unpack {
                digest: layer.digest.clone(),
                source: e,
            })?;
            tracing::debug!(digest = %layer.digest, role = ?layer.role, "layer unpacked");
        }

        tracing::info!(image = %id, root = %root.path().display(), "container created");
        Ok(Self {
            id,
            record,
            workdir,
            root,
        })
    }

    pub fn image_id(&self) -> &str {
        &self.id
    }

    pub fn record(&self) -> &ImageRecord {
        &self.record
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Host path of the image working directory.
    pub fn workdir_path(&self) -> PathBuf {
        self.root.path().join(self.workdir.relative())
    }

    /// Host path of a path inside the image.
    pub fn host_path(&self, image_path: &str) -> PathBuf {
        self.root.path().join(image_path.trim_start_matches('/'))
    }
}

fn unpack_layer(blob: &Path, root: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(File::open(blob)?);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(root)
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("image record has an invalid working directory")]
    InvalidRecord(#[source] kiln_core::Error),

    #[error("failed to create container root in {path}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to unpack layer {digest}")]
    Unpack {
        digest: String,
        source: std::io::Error,
    },
}
