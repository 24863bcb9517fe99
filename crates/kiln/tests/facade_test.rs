use std::path::Path;

use kiln::build::{DockerfileGenerator, ImageStore, LayerRole, build_image};
use kiln::engine::{CommandExecutor, EngineClient, ExecError};
use kiln::launch::{Container, LauncherState};
use kiln::{KilnConfig, LaunchCommand};
use tempfile::TempDir;

const BASE_ID: &str = "sha256:5d41402abc4b2a76b9719d911017c592ae2e5d41402abc4b2a76b9719d911017";

/// Engine that knows one base image and installs each requirement as an
/// empty package directory.
struct FakeEngine;

impl CommandExecutor for FakeEngine {
    async fn exec(&self, program: &str, args: &[String]) -> Result<String, ExecError> {
        match program {
            "docker" => Ok(format!("{BASE_ID}\n")),
            "pip" => {
                let flag = |name: &str| {
                    args.iter()
                        .position(|a| a == name)
                        .and_then(|i| args.get(i + 1))
                        .unwrap()
                        .clone()
                };
                let target = Path::new(&flag("--target")).to_path_buf();
                let manifest = std::fs::read_to_string(flag("-r")).unwrap();
                for name in manifest.lines().filter(|l| !l.trim().is_empty()) {
                    std::fs::create_dir_all(target.join(name)).unwrap();
                }
                Ok(String::new())
            }
            other => Err(ExecError::CommandFailed {
                program: other.to_owned(),
                args: args.to_vec(),
                stderr: "unexpected program".to_owned(),
            }),
        }
    }
}

fn project() -> TempDir {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("requirements.txt"), "fastapi\nuvicorn\n").unwrap();
    std::fs::create_dir(tmp.path().join("app")).unwrap();
    std::fs::write(tmp.path().join("app/main.py"), "app = object()\n").unwrap();
    tmp
}

#[tokio::test]
async fn build_and_unpack_through_facade() {
    let tmp = project();
    let config = KilnConfig::default();
    let store = ImageStore::open(&config.store_root(tmp.path())).unwrap();
    let engine = EngineClient::with_executor(FakeEngine, config.engine.clone());

    let image = build_image(tmp.path(), &config, &engine, &store, "facade")
        .await
        .unwrap();
    assert_eq!(image.record.base.id, BASE_ID);
    assert!(image.record.layer(LayerRole::Dependencies).is_some());

    let container = Container::create(&store, "facade").unwrap();
    assert_eq!(container.image_id(), image.id);
    assert!(container.workdir_path().join("app/main.py").is_file());
    assert!(container.workdir_path().join(".kiln-deps/fastapi").is_dir());
}

#[test]
fn core_types_are_flattened() {
    let config = KilnConfig::default();
    let command: LaunchCommand = config.launch.command();
    let plan = command.plan().unwrap();
    assert_eq!(plan.entry_point.to_string(), "app.main:app");
    assert_eq!(plan.bind_target().unwrap().port, 8000);
}

#[test]
fn dockerfile_through_facade() {
    let config = KilnConfig::default();
    let dockerfile = DockerfileGenerator::new(&config).render();
    assert!(dockerfile.contains("FROM python:3.11-slim"));
    assert!(dockerfile.contains("WORKDIR /app"));
}

#[test]
fn launcher_states_are_exported() {
    assert!(LauncherState::NotStarted.can_transition_to(LauncherState::Binding));
    assert!(LauncherState::Terminated.is_terminal());
}
