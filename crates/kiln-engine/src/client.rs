use std::fmt;
use std::path::Path;

use kiln_core::{EngineConfig, ImageRef, InstallConfig, KilnConfig};
use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::executor::{CommandExecutor, RealExecutor};

/// Container engine and installer operations, parameterized over the
/// executor for testability.
pub struct EngineClient<E: CommandExecutor = RealExecutor> {
    executor: E,
    engine: EngineConfig,
}

impl EngineClient<RealExecutor> {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            executor: RealExecutor,
            engine,
        }
    }
}

impl<E: CommandExecutor> EngineClient<E> {
    pub fn with_executor(executor: E, engine: EngineConfig) -> Self {
        Self { executor, engine }
    }

    // ── Base image ──

    /// Resolve a base image reference to the engine's image id.
    ///
    /// Inspects the local image first; when that fails and pulling is
    /// enabled, pulls and inspects again.
    pub async fn resolve_base(&self, image: &ImageRef) -> Result<ResolvedBase, ResolutionError> {
        let reference = image.to_string();

        match self.inspect(&reference).await {
            Ok(id) => return Ok(ResolvedBase { reference, id }),
            Err(ResolutionError::Unresolvable { detail, .. }) if self.engine.pull => {
                tracing::debug!(%reference, %detail, "base image not present locally");
            }
            Err(e) => return Err(e),
        }

        tracing::info!(%reference, engine = %self.engine.program, "pulling base image");
        self.executor
            .exec(&self.engine.program, &args(["pull", &reference]))
            .await
            .map_err(|e| self.resolution_error(&reference, e))?;

        let id = self.inspect(&reference).await?;
        Ok(ResolvedBase { reference, id })
    }

    async fn inspect(&self, reference: &str) -> Result<String, ResolutionError> {
        let output = self
            .executor
            .exec(
                &self.engine.program,
                &args(["image", "inspect", "--format", "{{.Id}}", reference]),
            )
            .await
            .map_err(|e| self.resolution_error(reference, e))?;

        let id = output.lines().next().unwrap_or_default().trim();
        if !is_content_id(id) {
            return Err(ResolutionError::UnexpectedId {
                reference: reference.to_owned(),
                output: output.trim().to_owned(),
            });
        }
        Ok(id.to_owned())
    }

    fn resolution_error(&self, reference: &str, error: ExecError) -> ResolutionError {
        match error {
            ExecError::NotFound { program, source } => {
                ResolutionError::EngineUnavailable { program, source }
            }
            ExecError::CommandFailed { stderr, .. } => ResolutionError::Unresolvable {
                reference: reference.to_owned(),
                detail: stderr.trim().to_owned(),
            },
            other => ResolutionError::Unresolvable {
                reference: reference.to_owned(),
                detail: other.to_string(),
            },
        }
    }

    // ── Dependencies ──

    /// Run the configured installer against `manifest`, installing into `target`.
    pub async fn install(
        &self,
        install: &InstallConfig,
        manifest: &Path,
        target: &Path,
    ) -> Result<(), InstallError> {
        let (program, rest) = install
            .command
            .split_first()
            .ok_or(InstallError::EmptyCommand)?;

        let manifest_str = manifest
            .to_str()
            .ok_or_else(|| InstallError::InvalidPath(manifest.to_path_buf()))?;
        let target_str = target
            .to_str()
            .ok_or_else(|| InstallError::InvalidPath(target.to_path_buf()))?;

        let argv: Vec<String> = rest
            .iter()
            .map(|arg| {
                arg.replace("{manifest}", manifest_str)
                    .replace("{target}", target_str)
            })
            .collect();

        tracing::info!(installer = %program, manifest = %manifest.display(), "installing dependencies");

        let output = self
            .executor
            .exec(program, &argv)
            .await
            .map_err(|e| match e {
                ExecError::NotFound { program, source } => {
                    InstallError::InstallerNotFound { program, source }
                }
                ExecError::CommandFailed { stderr, .. } => InstallError::Failed {
                    program: program.clone(),
                    detail: stderr.trim().to_owned(),
                },
                other => InstallError::Failed {
                    program: program.clone(),
                    detail: other.to_string(),
                },
            })?;

        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(installer = %program, "{line}");
        }
        Ok(())
    }

    // ── Doctor ──

    /// Run all diagnostic checks without early return.
    pub async fn doctor(&self, config: &KilnConfig) -> DoctorReport {
        let mut report = DoctorReport {
            engine: self.probe(&self.engine.program).await,
            ..DoctorReport::default()
        };

        report.installer = match config.install.command.first() {
            Some(program) => self.probe(program).await,
            None => CheckResult::fail("install command is empty"),
        };

        report.server = self.probe(&config.launch.server).await;

        report.base_image = match ImageRef::parse(&config.image.base) {
            Ok(_) => CheckResult::ok(&config.image.base),
            Err(e) => CheckResult::fail(&e.to_string()),
        };

        report.entry_point = match kiln_core::EntryPoint::parse(&config.launch.app) {
            Ok(ep) => CheckResult::ok(&ep.to_string()),
            Err(e) => CheckResult::fail(&e.to_string()),
        };

        report
    }

    async fn probe(&self, program: &str) -> CheckResult {
        match self.executor.exec(program, &args(["--version"])).await {
            Ok(v) => {
                let first = v.lines().next().unwrap_or_default().trim();
                if first.is_empty() {
                    CheckResult::ok(program)
                } else {
                    CheckResult::ok(first)
                }
            }
            Err(e) => CheckResult::fail(&e.to_string()),
        }
    }
}

fn is_content_id(id: &str) -> bool {
    id.strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

fn args<const N: usize>(a: [&str; N]) -> Vec<String> {
    a.iter().map(|s| (*s).to_owned()).collect()
}

/// A base image reference pinned to the engine's content id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBase {
    pub reference: String,
    pub id: String,
}

#[derive(Debug, Default, Clone)]
pub struct DoctorReport {
    pub engine: CheckResult,
    pub installer: CheckResult,
    pub server: CheckResult,
    pub base_image: CheckResult,
    pub entry_point: CheckResult,
    pub config_file: CheckResult,
}

impl DoctorReport {
    pub fn all_passed(&self) -> bool {
        self.rows().iter().all(|(_, r)| r.passed)
    }

    fn rows(&self) -> [(&'static str, &CheckResult); 6] {
        [
            ("Engine", &self.engine),
            ("Installer", &self.installer),
            ("Server", &self.server),
            ("Base image", &self.base_image),
            ("Entry point", &self.entry_point),
            ("Config file", &self.config_file),
        ]
    }
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, result) in self.rows() {
            writeln!(f, "{label:<12} [{}] {}", result.icon(), result.detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    pub fn ok(detail: &str) -> Self {
        Self {
            passed: true,
            detail: detail.to_owned(),
        }
    }

    pub fn fail(detail: &str) -> Self {
        Self {
            passed: false,
            detail: detail.to_owned(),
        }
    }

    pub fn icon(&self) -> &'static str {
        if self.passed { "OK" } else { "NG" }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("container engine {program} is not available")]
    EngineUnavailable {
        program: String,
        source: std::io::Error,
    },

    #[error("base image {reference} cannot be resolved: {detail}")]
    Unresolvable { reference: String, detail: String },

    #[error("engine reported an unexpected id for {reference}: {output:?}")]
    UnexpectedId { reference: String, output: String },
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("install command is empty")]
    EmptyCommand,

    #[error("path is not valid UTF-8: {0}")]
    InvalidPath(std::path::PathBuf),

    #[error("installer {program} not found")]
    InstallerNotFound {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} failed to install dependencies: {detail}")]
    Failed { program: String, detail: String },
}
