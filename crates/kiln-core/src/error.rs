use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to resolve project directory {path}")]
    ProjectDirResolve {
        path: PathBuf,
        source: std::io::Error,
    },

    // ── Image recipe ──
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidImageRef {
        reference: String,
        reason: &'static str,
    },

    #[error("invalid working directory {path:?}: {reason}")]
    InvalidWorkDir { path: String, reason: &'static str },

    #[error("failed to read dependency manifest {path}")]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid requirement at {path}:{line}: {detail}")]
    ManifestParse {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    // ── Launch command ──
    #[error("invalid entry point {reference:?}: {reason}")]
    InvalidEntryPoint {
        reference: String,
        reason: &'static str,
    },

    #[error("launch command has no entry point of the form <module-path>:<object-name>")]
    MissingEntryPoint,

    #[error("launch command is empty")]
    EmptyLaunchCommand,

    #[error("flag {flag} expects a value")]
    MissingFlagValue { flag: String },

    #[error("invalid bind host {host:?}")]
    InvalidHost { host: String },

    #[error("invalid bind port {value:?}: expected an integer in 1-65535")]
    InvalidPort { value: String },
}
