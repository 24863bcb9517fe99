use std::path::{Path, PathBuf};

/// Writes a rendered Dockerfile to `<project_dir>/Dockerfile`.
///
/// An existing Dockerfile is kept unless `force` is set.
pub fn export_dockerfile(
    project_dir: &Path,
    content: &str,
    force: bool,
) -> Result<PathBuf, ExportError> {
    let path = project_dir.join("Dockerfile");
    if path.exists() && !force {
        return Err(ExportError::AlreadyExists(path));
    }

    std::fs::write(&path, content).map_err(|e| ExportError::Write {
        path: path.clone(),
        source: e,
    })?;
    tracing::info!(path = %path.display(), "Dockerfile written");
    Ok(path)
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("{0} already exists; pass --force to overwrite")]
    AlreadyExists(PathBuf),
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}
