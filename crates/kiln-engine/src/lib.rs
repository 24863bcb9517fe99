//! External command execution for kiln: base image resolution through a
//! container engine CLI (`docker`, `podman`), dependency installation, and
//! readiness checks.

pub mod client;
pub mod error;
pub mod executor;

pub use client::{
    CheckResult, DoctorReport, EngineClient, InstallError, ResolutionError, ResolvedBase,
};
pub use error::ExecError;
pub use executor::{CommandExecutor, RealExecutor};
