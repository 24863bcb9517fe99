//! Process launcher for kiln images.
//!
//! A [`Container`] unpacks an image's layers into a private root; a
//! [`Launcher`] resolves the image's entry point against the application
//! tree, binds the configured host/port, starts the server and supervises
//! it until it exits or a shutdown signal arrives. There is no restart:
//! the server's exit becomes the launcher's exit.

pub mod bind;
pub mod container;
pub mod launcher;
pub mod resolve;
pub mod state;

pub use bind::{BindError, BindProbe, probe_bind};
pub use container::{Container, ContainerError};
pub use launcher::{LaunchError, LaunchOptions, Launcher, Termination, shutdown_signal};
pub use resolve::{EntryPointError, resolve_entry_point};
pub use state::LauncherState;
