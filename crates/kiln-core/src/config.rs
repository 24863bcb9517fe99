use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::launch::LaunchCommand;

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = "kiln.toml";

/// kiln.toml configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image tag (defaults to the project directory name)
    pub name: Option<String>,
    /// Base runtime image reference
    #[serde(default = "default_base_image")]
    pub base: String,
    /// Absolute working directory inside the image
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Dependency manifest, relative to the project directory
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Application source tree, relative to the project directory
    #[serde(default = "default_source")]
    pub source: PathBuf,
    /// Path prefixes left out of the application tree, in addition to
    /// `.git` and the store directory.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Static environment variables baked into the image.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Installer argv. `{manifest}` and `{target}` are substituted with the
    /// staged manifest and the dependency target directory.
    #[serde(default = "default_install_command")]
    pub command: Vec<String>,
    /// Variable pointing the launched server at the installed dependencies
    #[serde(default = "default_path_env")]
    pub path_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Container engine CLI used to resolve base images
    #[serde(default = "default_engine_program")]
    pub program: String,
    /// Pull the base image when it is not present locally
    #[serde(default = "default_pull")]
    pub pull: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Server program started at launch
    #[serde(default = "default_server")]
    pub server: String,
    /// Entry point reference `<module-path>:<object-name>`
    #[serde(default = "default_app")]
    pub app: String,
    /// Host the server binds
    #[serde(default = "default_host")]
    pub host: String,
    /// Port the server binds
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra server arguments appended after the bind flags
    #[serde(default)]
    pub args: Vec<String>,
    /// File extension of application modules
    #[serde(default = "default_module_suffix")]
    pub module_suffix: String,
    /// Dotenv file loaded from the working directory at launch
    #[serde(default = "default_env_file")]
    pub env_file: Option<String>,
    /// Seconds between forwarding a termination signal and killing the server
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Image store directory, relative to the project directory
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: None,
            base: default_base_image(),
            workdir: default_workdir(),
            manifest: default_manifest(),
            source: default_source(),
            exclude: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: default_install_command(),
            path_env: default_path_env(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            pull: default_pull(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            app: default_app(),
            host: default_host(),
            port: default_port(),
            args: Vec::new(),
            module_suffix: default_module_suffix(),
            env_file: default_env_file(),
            grace_period_secs: default_grace_period(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

impl KilnConfig {
    /// Load from kiln.toml at the given path, or return defaults if not found.
    pub fn load(project_dir: &Path) -> crate::Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|e| crate::Error::ConfigLoad {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&content).map_err(|e| crate::Error::ConfigParse {
                path: config_path,
                source: e,
            })
        } else {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Tag for built images: `[image].name`, else the project directory name.
    pub fn image_name(&self, project_dir: &Path) -> crate::Result<String> {
        if let Some(name) = &self.image.name {
            return Ok(name.clone());
        }
        let dir = project_dir
            .canonicalize()
            .map_err(|e| crate::Error::ProjectDirResolve {
                path: project_dir.to_path_buf(),
                source: e,
            })?;
        Ok(dir
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "app".to_owned()))
    }

    /// Absolute location of the image store.
    pub fn store_root(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.store.root)
    }
}

impl LaunchConfig {
    /// The argv recorded in the image: `<server> <app> --host <host> --port <port> [args..]`.
    pub fn command(&self) -> LaunchCommand {
        let mut argv = vec![
            self.server.clone(),
            self.app.clone(),
            "--host".to_owned(),
            self.host.clone(),
            "--port".to_owned(),
            self.port.to_string(),
        ];
        argv.extend(self.args.iter().cloned());
        LaunchCommand::new(argv)
    }
}

fn default_base_image() -> String {
    "python:3.11-slim".to_owned()
}

fn default_workdir() -> String {
    "/app".to_owned()
}

fn default_manifest() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_source() -> PathBuf {
    PathBuf::from(".")
}

fn default_install_command() -> Vec<String> {
    [
        "pip",
        "install",
        "--no-cache-dir",
        "--target",
        "{target}",
        "-r",
        "{manifest}",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}

fn default_path_env() -> Option<String> {
    Some("PYTHONPATH".to_owned())
}

fn default_engine_program() -> String {
    "docker".to_owned()
}

fn default_pull() -> bool {
    true
}

fn default_server() -> String {
    "uvicorn".to_owned()
}

fn default_app() -> String {
    "app.main:app".to_owned()
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8000
}

fn default_module_suffix() -> String {
    "py".to_owned()
}

fn default_env_file() -> Option<String> {
    Some(".env".to_owned())
}

fn default_grace_period() -> u64 {
    10
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".kiln")
}
