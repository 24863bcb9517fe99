//! Image build pipeline, local image store, and Dockerfile rendering for kiln.
//!
//! # Build pipeline
//!
//! ```text
//! kiln build
//!   1. Base        ── <engine> image inspect / pull → ResolvedBase
//!   2. Workdir     ── WorkDir::new([image].workdir)
//!   3. Manifest    ── manifest layer  (<workdir>/requirements.txt)
//!   4. Install     ── [install].command → dependencies layer (<workdir>/.kiln-deps)
//!   5. Copy        ── source tree → application layer (<workdir>/)
//!   6. Entrypoint  ── [launch] → LaunchCommand
//!   7. Commit      ── blobs/sha256/*, image record, images/<tag>
//! ```
//!
//! # Determinism
//!
//! Layers are tar archives with sorted entries, zeroed mtimes, root
//! ownership and normalised modes. The image record carries no timestamp
//! and no tag, so identical inputs produce the same image id.

pub mod dockerfile;
pub mod export;
pub mod image;
pub mod layer;
pub mod pipeline;
pub mod store;
pub mod tree;

pub use dockerfile::DockerfileGenerator;
pub use export::{ExportError, export_dockerfile};
pub use image::{DEPS_DIR, DependencyInfo, ImageRecord, LayerRecord, LayerRole};
pub use pipeline::{BuildError, BuiltImage, ImageBuilder, build_image};
pub use store::{ImageStore, StoreError};
pub use tree::CopyError;
