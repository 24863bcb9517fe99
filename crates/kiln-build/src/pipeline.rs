//! Type-state image build pipeline.
//!
//! ```text
//! ImageBuilder<Fresh>
//!   .set_base(ref)              -> Based           (ResolutionError)
//!   .set_working_directory(p)   -> Anchored
//!   .stage_manifest(path)       -> ManifestStaged  (manifest layer)
//!   .install(cfg)               -> Installed       (DependencyInstallError, deps layer)
//!   .copy_tree(src, dest, ex)   -> Copied          (CopyError, application layer)
//!   .set_entrypoint(argv)       -> Sealed
//!   .commit(tag)                -> BuiltImage      (writes the store)
//! ```
//!
//! Each step consumes the previous state, so the tree cannot be copied
//! before dependencies are installed. Layers are written to a staging
//! directory under the store's `tmp/`; dropping a builder at any step
//! removes the staging directory and leaves the store untouched.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use kiln_core::{DependencyManifest, ImageRef, InstallConfig, KilnConfig, LaunchCommand, WorkDir};
use kiln_engine::{CommandExecutor, EngineClient, InstallError, ResolutionError, ResolvedBase};
use tempfile::TempDir;

use crate::image::{
    DEPS_DIR, DependencyInfo, ImageRecord, LayerRecord, LayerRole, SCHEMA_VERSION,
};
use crate::layer::{LayerBlob, LayerBuilder};
use crate::store::{ImageStore, StoreError};
use crate::tree::{CopyError, collect_tree};

pub struct Fresh;

pub struct Based {
    base: ResolvedBase,
}

pub struct Anchored {
    base: ResolvedBase,
    workdir: WorkDir,
}

pub struct ManifestStaged {
    anchored: Anchored,
    manifest: DependencyManifest,
    staged_manifest: PathBuf,
    layer: LayerBlob,
}

pub struct Installed {
    staged: ManifestStaged,
    path_env: Option<String>,
    layer: LayerBlob,
}

pub struct Copied {
    installed: Installed,
    layer: LayerBlob,
}

pub struct Sealed {
    copied: Copied,
    entrypoint: LaunchCommand,
}

pub struct ImageBuilder<'a, E: CommandExecutor, S> {
    engine: &'a EngineClient<E>,
    store: &'a ImageStore,
    staging: TempDir,
    env: BTreeMap<String, String>,
    exposed_port: Option<u16>,
    state: S,
}

/// A committed image.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub id: String,
    pub tag: String,
    pub record: ImageRecord,
}

impl<'a, E: CommandExecutor> ImageBuilder<'a, E, Fresh> {
    pub fn new(engine: &'a EngineClient<E>, store: &'a ImageStore) -> Result<Self, BuildError> {
        let staging = store.staging()?;
        tracing::debug!(staging = %staging.path().display(), "opened build staging");
        Ok(Self {
            engine,
            store,
            staging,
            env: BTreeMap::new(),
            exposed_port: None,
            state: Fresh,
        })
    }

    /// Resolve the base image through the container engine.
    pub async fn set_base(self, image: &ImageRef) -> Result<ImageBuilder<'a, E, Based>, BuildError> {
        tracing::info!(base = %image, "resolving base image");
        let base = self.engine.resolve_base(image).await?;
        tracing::info!(base = %base.reference, id = %base.id, "base image resolved");
        Ok(self.advance(Based { base }))
    }
}

impl<'a, E: CommandExecutor, S> ImageBuilder<'a, E, S> {
    fn advance<T>(self, state: T) -> ImageBuilder<'a, E, T> {
        ImageBuilder {
            engine: self.engine,
            store: self.store,
            staging: self.staging,
            env: self.env,
            exposed_port: self.exposed_port,
            state,
        }
    }

    /// Bake an environment variable into the image.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Record the port the server listens on.
    pub fn expose(mut self, port: u16) -> Self {
        self.exposed_port = Some(port);
        self
    }

    fn layer_path(&self, role: LayerRole) -> PathBuf {
        let name = match role {
            LayerRole::Manifest => "manifest.tar",
            LayerRole::Dependencies => "dependencies.tar",
            LayerRole::Application => "application.tar",
        };
        self.staging.path().join(name)
    }
}

impl<'a, E: CommandExecutor> ImageBuilder<'a, E, Based> {
    pub fn set_working_directory(
        self,
        path: &str,
    ) -> Result<ImageBuilder<'a, E, Anchored>, BuildError> {
        let workdir = WorkDir::new(path).map_err(BuildError::InvalidWorkDir)?;
        tracing::info!(%workdir, "working directory set");
        let (builder, Based { base }) = self.split();
        Ok(builder.advance(Anchored { base, workdir }))
    }
}

impl<'a, E: CommandExecutor> ImageBuilder<'a, E, Anchored> {
    /// Setting the same working directory again is a no-op; a different one
    /// is rejected.
    pub fn set_working_directory(self, path: &str) -> Result<Self, BuildError> {
        let requested = WorkDir::new(path).map_err(BuildError::InvalidWorkDir)?;
        if requested != self.state.workdir {
            return Err(BuildError::WorkdirConflict {
                current: self.state.workdir.to_string(),
                requested: requested.to_string(),
            });
        }
        Ok(self)
    }

    pub fn workdir(&self) -> &WorkDir {
        &self.state.workdir
    }

    /// Read the manifest and stage it alone as the first layer.
    pub fn stage_manifest(
        self,
        manifest_path: &Path,
    ) -> Result<ImageBuilder<'a, E, ManifestStaged>, BuildError> {
        let manifest = DependencyManifest::load(manifest_path).map_err(BuildError::Manifest)?;
        let file_name = manifest_path
            .file_name()
            .ok_or_else(|| BuildError::ManifestStage {
                path: manifest_path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "manifest path has no file name",
                ),
            })?;

        let manifest_dir = self.staging.path().join("manifest");
        let staged_manifest = manifest_dir.join(file_name);
        std::fs::create_dir_all(&manifest_dir)
            .and_then(|()| std::fs::copy(manifest_path, &staged_manifest))
            .map_err(|e| BuildError::ManifestStage {
                path: manifest_path.to_path_buf(),
                source: e,
            })?;

        let mut layer = LayerBuilder::new();
        layer.add_file(
            &staged_manifest,
            &self.state.workdir.relative().join(file_name),
            false,
        );
        let layer = layer
            .write(&self.layer_path(LayerRole::Manifest))
            .map_err(|e| BuildError::DependencyCapture(CopyError::Layer(e)))?;

        tracing::info!(
            manifest = %manifest_path.display(),
            requirements = manifest.requirements.len(),
            layer = %layer.digest,
            "dependency manifest staged"
        );

        let (builder, anchored) = self.split();
        Ok(builder.advance(ManifestStaged {
            anchored,
            manifest,
            staged_manifest,
            layer,
        }))
    }
}

impl<'a, E: CommandExecutor> ImageBuilder<'a, E, ManifestStaged> {
    /// Run the installer against the staged manifest and capture what it
    /// installed as the dependencies layer.
    pub async fn install(
        self,
        install: &InstallConfig,
    ) -> Result<ImageBuilder<'a, E, Installed>, BuildError> {
        let target = self.staging.path().join("deps");
        std::fs::create_dir_all(&target).map_err(|e| BuildError::ManifestStage {
            path: target.clone(),
            source: e,
        })?;

        if self.state.manifest.is_empty() {
            tracing::info!("manifest declares no dependencies");
        }
        self.engine
            .install(install, &self.state.staged_manifest, &target)
            .await?;

        let tree = collect_tree(&target, &[]).map_err(BuildError::DependencyCapture)?;
        let mut layer = LayerBuilder::new();
        layer.add_tree(&tree, &self.state.anchored.workdir.relative().join(DEPS_DIR));
        let layer = layer
            .write(&self.layer_path(LayerRole::Dependencies))
            .map_err(|e| BuildError::DependencyCapture(CopyError::Layer(e)))?;

        tracing::info!(entries = tree.len(), layer = %layer.digest, "dependencies installed");

        let path_env = install.path_env.clone();
        let (builder, staged) = self.split();
        Ok(builder.advance(Installed {
            staged,
            path_env,
            layer,
        }))
    }
}

impl<'a, E: CommandExecutor> ImageBuilder<'a, E, Installed> {
    /// Copy the application tree at `source` to `<workdir>/<dest>`.
    ///
    /// `dest` must be relative; `.` copies into the working directory itself.
    pub fn copy_tree(
        self,
        source: &Path,
        dest: &Path,
        excludes: &[String],
    ) -> Result<ImageBuilder<'a, E, Copied>, BuildError> {
        let dest = normalise_destination(dest).map_err(BuildError::Copy)?;
        let tree = collect_tree(source, excludes).map_err(BuildError::Copy)?;

        let image_root = self.state.staged.anchored.workdir.relative().join(&dest);
        let mut layer = LayerBuilder::new();
        layer.add_tree(&tree, &image_root);
        let layer = layer
            .write(&self.layer_path(LayerRole::Application))
            .map_err(|e| BuildError::Copy(CopyError::Layer(e)))?;

        tracing::info!(
            source = %source.display(),
            entries = tree.len(),
            layer = %layer.digest,
            "application tree copied"
        );

        let (builder, installed) = self.split();
        Ok(builder.advance(Copied { installed, layer }))
    }
}

impl<'a, E: CommandExecutor> ImageBuilder<'a, E, Copied> {
    /// Record the launch command. Not validated until launch.
    pub fn set_entrypoint(self, command: LaunchCommand) -> ImageBuilder<'a, E, Sealed> {
        tracing::info!(entrypoint = %command, "entrypoint set");
        let (builder, copied) = self.split();
        builder.advance(Sealed {
            copied,
            entrypoint: command,
        })
    }
}

impl<'a, E: CommandExecutor> ImageBuilder<'a, E, Sealed> {
    /// The image record this builder would commit.
    pub fn record(&self) -> ImageRecord {
        let Sealed { copied, entrypoint } = &self.state;
        let installed = &copied.installed;
        let staged = &installed.staged;
        let workdir = &staged.anchored.workdir;

        let layers = [
            (LayerRole::Manifest, &staged.layer),
            (LayerRole::Dependencies, &installed.layer),
            (LayerRole::Application, &copied.layer),
        ]
        .into_iter()
        .map(|(role, blob)| LayerRecord {
            role,
            digest: blob.digest.clone(),
            size: blob.size,
        })
        .collect();

        ImageRecord {
            schema_version: SCHEMA_VERSION,
            base: staged.anchored.base.clone(),
            workdir: workdir.to_string(),
            env: self.env.clone(),
            exposed_port: self.exposed_port,
            dependencies: DependencyInfo {
                path: workdir.as_path().join(DEPS_DIR).display().to_string(),
                path_env: installed.path_env.clone(),
                requirements: staged.manifest.names().map(str::to_owned).collect(),
            },
            layers,
            entrypoint: entrypoint.clone(),
        }
    }

    /// Move the staged layers into the store, write the image record and
    /// point `tag` at it.
    pub fn commit(self, tag: &str) -> Result<BuiltImage, BuildError> {
        let record = self.record();
        let Sealed { copied, .. } = &self.state;
        for blob in [
            &copied.installed.staged.layer,
            &copied.installed.layer,
            &copied.layer,
        ] {
            self.store.ingest(&blob.path, &blob.digest)?;
        }

        let id = self.store.write_record(&record)?;
        self.store.tag(tag, &id)?;
        tracing::info!(%tag, %id, "image committed");

        Ok(BuiltImage {
            id,
            tag: tag.to_owned(),
            record,
        })
    }
}

impl<'a, E: CommandExecutor, S> ImageBuilder<'a, E, S> {
    fn split(self) -> (ImageBuilder<'a, E, Fresh>, S) {
        let builder = ImageBuilder {
            engine: self.engine,
            store: self.store,
            staging: self.staging,
            env: self.env,
            exposed_port: self.exposed_port,
            state: Fresh,
        };
        (builder, self.state)
    }
}

fn normalise_destination(dest: &Path) -> Result<PathBuf, CopyError> {
    let mut normalised = PathBuf::new();
    for component in dest.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalised.push(part),
            _ => return Err(CopyError::InvalidDestination(dest.to_path_buf())),
        }
    }
    Ok(normalised)
}

/// Run the full pipeline for a project directory and tag the result.
pub async fn build_image<E: CommandExecutor>(
    project_dir: &Path,
    config: &KilnConfig,
    engine: &EngineClient<E>,
    store: &ImageStore,
    tag: &str,
) -> Result<BuiltImage, BuildError> {
    let base = ImageRef::parse(&config.image.base).map_err(BuildError::InvalidBase)?;
    let manifest = project_dir.join(&config.image.manifest);
    let source = project_dir.join(&config.image.source);

    let mut excludes = config.image.exclude.clone();
    if let Ok(store_dir) = store.root().strip_prefix(&source) {
        excludes.push(store_dir.display().to_string());
    }

    let mut builder = ImageBuilder::new(engine, store)?;
    for (key, value) in &config.image.env {
        builder = builder.env(key, value);
    }

    builder
        .expose(config.launch.port)
        .set_base(&base)
        .await?
        .set_working_directory(&config.image.workdir)?
        .stage_manifest(&manifest)?
        .install(&config.install)
        .await?
        .copy_tree(&source, Path::new("."), &excludes)?
        .set_entrypoint(config.launch.command())
        .commit(tag)
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid base image reference")]
    InvalidBase(#[source] kiln_core::Error),

    #[error("failed to resolve base image")]
    Resolution(#[from] ResolutionError),

    #[error("invalid working directory")]
    InvalidWorkDir(#[source] kiln_core::Error),

    #[error("working directory is already {current}, cannot change it to {requested}")]
    WorkdirConflict { current: String, requested: String },

    #[error("failed to read dependency manifest")]
    Manifest(#[source] kiln_core::Error),

    #[error("failed to stage dependency manifest {path}")]
    ManifestStage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("dependency installation failed")]
    Install(#[from] InstallError),

    #[error("failed to capture installed dependencies")]
    DependencyCapture(#[source] CopyError),

    #[error("failed to copy application tree")]
    Copy(#[source] CopyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BuildError {
    /// Build stage that failed, for diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidBase(_) | Self::Resolution(_) => "base image resolution",
            Self::InvalidWorkDir(_) | Self::WorkdirConflict { .. } => "working directory",
            Self::Manifest(_)
            | Self::ManifestStage { .. }
            | Self::Install(_)
            | Self::DependencyCapture(_) => "dependency installation",
            Self::Copy(_) => "application copy",
            Self::Store(_) => "commit",
        }
    }

    pub fn exit_code(&self) -> u8 {
        use kiln_core::exit;
        match self {
            Self::InvalidBase(_) | Self::Resolution(_) => exit::RESOLUTION,
            Self::Manifest(_)
            | Self::ManifestStage { .. }
            | Self::Install(_)
            | Self::DependencyCapture(_) => exit::DEPENDENCY_INSTALL,
            Self::Copy(_) => exit::COPY,
            Self::InvalidWorkDir(_) | Self::WorkdirConflict { .. } | Self::Store(_) => {
                exit::FAILURE
            }
        }
    }
}
