#![cfg(unix)]

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_build::image::{DependencyInfo, ImageRecord, LayerRecord, LayerRole};
use kiln_build::layer::LayerBuilder;
use kiln_build::store::ImageStore;
use kiln_build::tree::collect_tree;
use kiln_core::{BindTarget, LaunchCommand, LaunchConfig, exit};
use kiln_engine::ResolvedBase;
use kiln_launch::bind::{BindError, probe_bind};
use kiln_launch::container::Container;
use kiln_launch::launcher::{LaunchError, LaunchOptions, Launcher, Termination};
use kiln_launch::resolve::EntryPointError;
use kiln_launch::state::LauncherState;
use tempfile::TempDir;
use tokio::sync::{oneshot, watch};

const BASE_ID: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

fn write_app(dir: &Path) {
    std::fs::create_dir_all(dir.join("app")).unwrap();
    std::fs::write(dir.join("app/__init__.py"), "").unwrap();
    std::fs::write(
        dir.join("app/main.py"),
        "from fastapi import FastAPI\n\napp = FastAPI()\n",
    )
    .unwrap();
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// `sh -c <script> <entry> --host 127.0.0.1 --port <port>`; the entry point
/// lands in `$0` and is ignored by the script.
fn shell_server(script: &str, entry: &str, port: u16) -> LaunchCommand {
    shell_server_on(script, entry, "127.0.0.1", port)
}

fn shell_server_on(script: &str, entry: &str, host: &str, port: u16) -> LaunchCommand {
    let port = port.to_string();
    LaunchCommand::new(
        ["sh", "-c", script, entry, "--host", host, "--port", port.as_str()]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
    )
}

fn write_executable(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Records every state the launcher publishes until it is dropped.
fn record_states(
    mut rx: watch::Receiver<LauncherState>,
) -> tokio::task::JoinHandle<Vec<LauncherState>> {
    tokio::spawn(async move {
        let mut seen = vec![*rx.borrow_and_update()];
        while rx.changed().await.is_ok() {
            seen.push(*rx.borrow_and_update());
        }
        seen
    })
}

// ── Serving and shutdown ──

#[tokio::test]
async fn serves_until_shutdown_then_exits_cleanly() {
    let app = TempDir::new().unwrap();
    write_app(app.path());
    let port = free_port();

    let launcher = Launcher::new(
        shell_server("exec sleep 30", "app.main:app", port),
        app.path(),
        LaunchOptions::default(),
    );
    let mut states = launcher.subscribe();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(launcher.launch_until(async move {
        let _ = stop_rx.await;
    }));

    states
        .wait_for(|s| *s == LauncherState::Serving)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    stop_tx.send(()).unwrap();
    let termination = handle.await.unwrap().unwrap();

    assert_eq!(
        termination,
        Termination::Stopped {
            code: None,
            forced: false
        }
    );
    assert_eq!(termination.exit_code(), exit::SUCCESS);
}

#[tokio::test]
async fn server_ignoring_sigterm_is_killed_after_grace_period() {
    let app = TempDir::new().unwrap();
    write_app(app.path());
    let port = free_port();

    let options = LaunchOptions {
        grace_period: Duration::from_millis(200),
        ..LaunchOptions::default()
    };
    let launcher = Launcher::new(
        shell_server("trap '' TERM; exec sleep 30", "app.main:app", port),
        app.path(),
        options,
    );
    let mut states = launcher.subscribe();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(launcher.launch_until(async move {
        let _ = stop_rx.await;
    }));
    states
        .wait_for(|s| *s == LauncherState::Serving)
        .await
        .unwrap();
    stop_tx.send(()).unwrap();

    let termination = handle.await.unwrap().unwrap();
    assert_eq!(
        termination,
        Termination::Stopped {
            code: None,
            forced: true
        }
    );
    assert_eq!(termination.exit_code(), 137);
}

#[tokio::test]
async fn server_exit_code_passes_through() {
    let app = TempDir::new().unwrap();
    write_app(app.path());

    let launcher = Launcher::new(
        shell_server("exit 3", "app.main:app", free_port()),
        app.path(),
        LaunchOptions::default(),
    );
    let states = record_states(launcher.subscribe());

    let termination = launcher
        .launch_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(termination, Termination::Exited { code: 3 });
    assert_eq!(termination.exit_code(), 3);
    assert_eq!(
        states.await.unwrap().last(),
        Some(&LauncherState::Terminated)
    );
}

#[tokio::test]
async fn server_killed_by_signal_maps_to_128_plus_signal() {
    let app = TempDir::new().unwrap();
    write_app(app.path());

    let launcher = Launcher::new(
        shell_server("kill -KILL $$", "app.main:app", free_port()),
        app.path(),
        LaunchOptions::default(),
    );
    let termination = launcher
        .launch_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(termination, Termination::Signalled { signal: 9 });
    assert_eq!(termination.exit_code(), 137);
}

// ── Bind failures ──

#[tokio::test]
async fn occupied_port_fails_without_serving() {
    let app = TempDir::new().unwrap();
    write_app(app.path());
    let occupant = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupant.local_addr().unwrap().port();

    for host in ["127.0.0.1", "localhost"] {
        let launcher = Launcher::new(
            shell_server_on("exec sleep 30", "app.main:app", host, port),
            app.path(),
            LaunchOptions::default(),
        );
        let states = record_states(launcher.subscribe());

        let err = launcher
            .launch_until(std::future::pending())
            .await
            .unwrap_err();

        assert!(
            matches!(err, LaunchError::Bind(BindError::InUse { .. })),
            "{host}: {err:?}"
        );
        assert_eq!(err.exit_code(), exit::BIND);

        let seen = states.await.unwrap();
        assert!(!seen.contains(&LauncherState::Serving), "{host}");
        assert_eq!(seen.last(), Some(&LauncherState::Terminated));
    }
    drop(occupant);
}

#[tokio::test]
async fn bind_check_holds_every_resolved_address() {
    let port = free_port();
    let target = BindTarget::parse("localhost", &port.to_string()).unwrap();

    let bound = probe_bind(&target).await.unwrap();
    assert!(!bound.addrs().is_empty());
    assert!(bound.addrs().iter().all(|addr| addr.port() == port));
    for addr in bound.addrs() {
        assert!(std::net::TcpListener::bind(addr).is_err(), "{addr} not held");
    }

    let held = bound.addrs().to_vec();
    bound.release();
    for addr in held {
        std::net::TcpListener::bind(addr).unwrap();
    }
}

#[tokio::test]
async fn bind_check_fails_when_any_resolved_address_is_taken() {
    let occupant = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupant.local_addr().unwrap().port();
    let target = BindTarget::parse("localhost", &port.to_string()).unwrap();

    let err = probe_bind(&target).await.unwrap_err();
    assert!(matches!(err, BindError::InUse { addr } if addr.port() == port));
}

#[tokio::test]
async fn invalid_port_is_bind_error() {
    let app = TempDir::new().unwrap();
    write_app(app.path());

    let command = LaunchCommand::new(
        ["uvicorn", "app.main:app", "--port", "70000"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
    );
    let err = Launcher::new(command, app.path(), LaunchOptions::default())
        .launch_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, LaunchError::Bind(BindError::InvalidTarget(_))));
    assert_eq!(err.exit_code(), exit::BIND);
}

#[tokio::test]
async fn missing_port_value_is_bind_error() {
    let app = TempDir::new().unwrap();
    write_app(app.path());

    let command = LaunchCommand::new(
        ["uvicorn", "app.main:app", "--port"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
    );
    let err = Launcher::new(command, app.path(), LaunchOptions::default())
        .launch_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LaunchError::Bind(BindError::InvalidTarget(kiln_core::Error::MissingFlagValue { .. }))
    ));
    assert_eq!(err.exit_code(), exit::BIND);
}

#[tokio::test]
async fn missing_port_value_does_not_mask_unresolvable_entry_point() {
    let app = TempDir::new().unwrap();
    write_app(app.path());

    let command = LaunchCommand::new(
        ["uvicorn", "missing:app", "--port"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
    );
    let launcher = Launcher::new(command, app.path(), LaunchOptions::default());
    let states = record_states(launcher.subscribe());

    let err = launcher
        .launch_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LaunchError::EntryPoint(EntryPointError::ModuleNotFound { .. })
    ));
    assert_eq!(err.exit_code(), exit::ENTRY_POINT_RESOLUTION);
    assert!(!states.await.unwrap().contains(&LauncherState::Binding));
}

// ── Entry point resolution ──

#[tokio::test]
async fn unresolvable_entry_point_fails_before_binding() {
    let app = TempDir::new().unwrap();
    write_app(app.path());
    let occupant = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupant.local_addr().unwrap().port();

    let launcher = Launcher::new(
        shell_server("exec sleep 30", "app.server:app", port),
        app.path(),
        LaunchOptions::default(),
    );
    let states = record_states(launcher.subscribe());

    let err = launcher
        .launch_until(std::future::pending())
        .await
        .unwrap_err();

    // The occupied port would be a BindError had binding been attempted.
    assert!(matches!(
        err,
        LaunchError::EntryPoint(EntryPointError::ModuleNotFound { .. })
    ));
    assert_eq!(err.exit_code(), exit::ENTRY_POINT_RESOLUTION);

    let seen = states.await.unwrap();
    assert!(!seen.contains(&LauncherState::Binding));
    assert_eq!(seen.last(), Some(&LauncherState::Terminated));
    drop(occupant);
}

#[tokio::test]
async fn missing_object_is_entry_point_error() {
    let app = TempDir::new().unwrap();
    write_app(app.path());

    let err = Launcher::new(
        shell_server("exit 0", "app.main:application", free_port()),
        app.path(),
        LaunchOptions::default(),
    )
    .launch_until(std::future::pending())
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        LaunchError::EntryPoint(EntryPointError::ObjectNotDefined { .. })
    ));
}

#[tokio::test]
async fn package_init_module_resolves() {
    let app = TempDir::new().unwrap();
    std::fs::create_dir_all(app.path().join("service")).unwrap();
    std::fs::write(
        app.path().join("service/__init__.py"),
        "async def app(scope, receive, send):\n    pass\n",
    )
    .unwrap();

    let termination = Launcher::new(
        shell_server("exit 0", "service:app", free_port()),
        app.path(),
        LaunchOptions::default(),
    )
    .launch_until(std::future::pending())
    .await
    .unwrap();

    assert_eq!(termination.exit_code(), exit::SUCCESS);
}

#[tokio::test]
async fn command_without_entry_point_is_rejected() {
    let app = TempDir::new().unwrap();

    let command = LaunchCommand::new(vec!["uvicorn".to_owned(), "--reload".to_owned()]);
    let err = Launcher::new(command, app.path(), LaunchOptions::default())
        .launch_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, LaunchError::EntryPoint(EntryPointError::Invalid(_))));
}

// ── Spawn and environment ──

#[tokio::test]
async fn missing_server_program_is_spawn_error() {
    let app = TempDir::new().unwrap();
    write_app(app.path());

    let port = free_port().to_string();
    let command = LaunchCommand::new(
        [
            "/nonexistent/kiln-test-server",
            "app.main:app",
            "--host",
            "127.0.0.1",
            "--port",
            port.as_str(),
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect(),
    );
    let launcher = Launcher::new(command, app.path(), LaunchOptions::default());
    let states = record_states(launcher.subscribe());

    let err = launcher
        .launch_until(std::future::pending())
        .await
        .unwrap_err();

    assert!(matches!(err, LaunchError::Spawn { .. }));
    assert_eq!(err.exit_code(), exit::SPAWN);
    assert!(!states.await.unwrap().contains(&LauncherState::Serving));
}

#[tokio::test]
async fn environment_layers_image_env_dotenv_and_dependency_path() {
    let app = TempDir::new().unwrap();
    write_app(app.path());
    std::fs::write(
        app.path().join(".env"),
        "KILN_TEST_GREETING=from-dotenv\nKILN_TEST_FROM_FILE=dotenv\n",
    )
    .unwrap();

    let options = LaunchOptions {
        env: BTreeMap::from([("KILN_TEST_GREETING".to_owned(), "hello".to_owned())]),
        env_file: Some(app.path().join(".env")),
        dependency_path: Some(("KILN_TEST_DEPS".to_owned(), PathBuf::from("/deps"))),
        ..LaunchOptions::default()
    };
    let script = r#"echo "$KILN_TEST_GREETING $KILN_TEST_FROM_FILE $KILN_TEST_DEPS" > env.out"#;

    let termination = Launcher::new(
        shell_server(script, "app.main:app", free_port()),
        app.path(),
        options,
    )
    .launch_until(std::future::pending())
    .await
    .unwrap();

    assert_eq!(termination, Termination::Exited { code: 0 });
    let output = std::fs::read_to_string(app.path().join("env.out")).unwrap();
    assert_eq!(output.trim(), "hello dotenv /deps");
}

#[tokio::test]
async fn server_is_found_on_program_path() {
    let app = TempDir::new().unwrap();
    write_app(app.path());
    let bin = app.path().join("deps/bin");
    write_executable(&bin.join("kiln-test-server"), "#!/bin/sh\nexit 5\n");

    let port = free_port().to_string();
    let command = LaunchCommand::new(
        ["kiln-test-server", "app.main:app", "--host", "127.0.0.1", "--port", port.as_str()]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
    );
    let options = LaunchOptions {
        program_path: vec![bin],
        ..LaunchOptions::default()
    };

    let termination = Launcher::new(command, app.path(), options)
        .launch_until(std::future::pending())
        .await
        .unwrap();

    assert_eq!(termination, Termination::Exited { code: 5 });
}

// ── Containers ──

fn store_image(store: &ImageStore, source: &Path, entrypoint: LaunchCommand) -> String {
    let staging = store.staging().unwrap();
    let tree = collect_tree(source, &[]).unwrap();
    let mut layer = LayerBuilder::new();
    layer.add_tree(&tree, Path::new("app"));
    let blob = layer.write(&staging.path().join("application.tar")).unwrap();
    store.ingest(&blob.path, &blob.digest).unwrap();

    let record = ImageRecord {
        schema_version: 1,
        base: ResolvedBase {
            reference: "python:3.11-slim".to_owned(),
            id: BASE_ID.to_owned(),
        },
        workdir: "/app".to_owned(),
        env: BTreeMap::from([("KILN_TEST_APP_ENV".to_owned(), "container".to_owned())]),
        exposed_port: None,
        dependencies: DependencyInfo {
            path: "/app/.kiln-deps".to_owned(),
            path_env: Some("KILN_TEST_IMAGE_DEPS".to_owned()),
            requirements: vec![],
        },
        layers: vec![LayerRecord {
            role: LayerRole::Application,
            digest: blob.digest,
            size: blob.size,
        }],
        entrypoint,
    };
    let id = store.write_record(&record).unwrap();
    store.tag("demo", &id).unwrap();
    id
}

#[tokio::test]
async fn container_unpacks_image_and_launches_entrypoint() {
    let project = TempDir::new().unwrap();
    let source = project.path().join("src");
    write_app(&source);
    let store = ImageStore::open(&project.path().join(".kiln")).unwrap();

    let script = r#"echo "$KILN_TEST_APP_ENV $KILN_TEST_IMAGE_DEPS" > launched.out"#;
    let id = store_image(&store, &source, shell_server(script, "app.main:app", free_port()));

    let container = Container::create(&store, "demo").unwrap();
    assert_eq!(container.image_id(), id);
    assert!(container.workdir_path().join("app/main.py").is_file());

    let termination = Launcher::for_container(&container, &LaunchConfig::default())
        .launch_until(std::future::pending())
        .await
        .unwrap();
    assert_eq!(termination.exit_code(), exit::SUCCESS);

    let output = std::fs::read_to_string(container.workdir_path().join("launched.out")).unwrap();
    let expected_deps = container.root().join("app/.kiln-deps");
    assert_eq!(
        output.trim(),
        format!("container {}", expected_deps.display())
    );

    let root = container.root().to_path_buf();
    drop(container);
    assert!(!root.exists());
}

#[tokio::test]
async fn container_runs_server_installed_with_dependencies() {
    let project = TempDir::new().unwrap();
    let source = project.path().join("src");
    write_app(&source);
    write_executable(
        &source.join(".kiln-deps/bin/kiln-test-server"),
        "#!/bin/sh\necho \"$PATH\" > path.out\nexit 5\n",
    );
    let store = ImageStore::open(&project.path().join(".kiln")).unwrap();

    let port = free_port().to_string();
    let entrypoint = LaunchCommand::new(
        ["kiln-test-server", "app.main:app", "--host", "127.0.0.1", "--port", port.as_str()]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
    );
    store_image(&store, &source, entrypoint);

    let container = Container::create(&store, "demo").unwrap();
    let termination = Launcher::for_container(&container, &LaunchConfig::default())
        .launch_until(std::future::pending())
        .await
        .unwrap();
    assert_eq!(termination.exit_code(), 5);

    let path = std::fs::read_to_string(container.workdir_path().join("path.out")).unwrap();
    let deps_bin = container.root().join("app/.kiln-deps/bin");
    assert!(path.trim().starts_with(&format!("{}:", deps_bin.display())));
}

#[test]
fn container_for_unknown_image_fails() {
    let tmp = TempDir::new().unwrap();
    let store = ImageStore::open(tmp.path()).unwrap();

    assert!(Container::create(&store, "missing").is_err());
}
