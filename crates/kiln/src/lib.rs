//! Build container images from a project recipe and launch their server.
//!
//! This is the unified facade crate that re-exports all kiln sub-crates.
//! Use feature flags to control which components are included.
//!
//! # Feature flags
//!
//! | Feature | Default | Crate | Description |
//! |---------|---------|-------|-------------|
//! | `core` | yes | [`kiln-core`](https://crates.io/crates/kiln-core) | Configuration, recipe and launch command types |
//! | `engine` | yes | [`kiln-engine`](https://crates.io/crates/kiln-engine) | Base image resolution and dependency installation |
//! | `build` | yes | [`kiln-build`](https://crates.io/crates/kiln-build) | Build pipeline, image store, Dockerfile rendering |
//! | `launch` | yes | [`kiln-launch`](https://crates.io/crates/kiln-launch) | Containers and the server process launcher |
//!
//! # Quick start
//!
//! ```toml
//! [dependencies]
//! kiln = "0.4"
//! ```
//!
//! ```rust,no_run
//! use std::path::Path;
//! use kiln::KilnConfig;
//! use kiln::build::{ImageStore, build_image};
//! use kiln::engine::EngineClient;
//! use kiln::launch::{Container, Launcher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let project = Path::new(".");
//! let config = KilnConfig::load(project)?;
//! let store = ImageStore::open(&config.store_root(project))?;
//! let engine = EngineClient::new(config.engine.clone());
//!
//! let image = build_image(project, &config, &engine, &store, "my-app").await?;
//! let container = Container::create(&store, &image.id)?;
//! let termination = Launcher::for_container(&container, &config.launch)
//!     .launch()
//!     .await?;
//! std::process::exit(termination.exit_code().into());
//! # }
//! ```

// Core types flattened into root namespace for convenience.
#[cfg(feature = "core")]
pub use kiln_core::*;

/// Base image resolution, dependency installation and readiness checks.
///
/// See [`kiln-engine`](https://crates.io/crates/kiln-engine) for details.
#[cfg(feature = "engine")]
pub mod engine {
    pub use kiln_engine::*;
}

/// Image build pipeline, local image store, and Dockerfile rendering.
///
/// See [`kiln-build`](https://crates.io/crates/kiln-build) for details.
#[cfg(feature = "build")]
pub mod build {
    pub use kiln_build::*;
}

/// Containers and the server process launcher.
///
/// See [`kiln-launch`](https://crates.io/crates/kiln-launch) for details.
#[cfg(feature = "launch")]
pub mod launch {
    pub use kiln_launch::*;
}
