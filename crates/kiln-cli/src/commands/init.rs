use std::path::Path;

use kiln_core::CONFIG_FILE;

const KILN_TOML: &str = r#"[image]
# name = "my-app"
base = "python:3.11-slim"
workdir = "/app"
manifest = "requirements.txt"
# source = "."
# exclude = ["tests/"]

[install]
# command = ["pip", "install", "--no-cache-dir", "--target", "{target}", "-r", "{manifest}"]
# path_env = "PYTHONPATH"

[engine]
# program = "docker"
# pull = true

[launch]
server = "uvicorn"
app = "app.main:app"
host = "0.0.0.0"
port = 8000
# env_file = ".env"
# grace_period_secs = 10
"#;

/// Write a starter kiln.toml into the current directory.
pub fn init_project() -> anyhow::Result<()> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() {
        eprintln!("{CONFIG_FILE} already exists, skipping");
        return Ok(());
    }

    std::fs::write(path, KILN_TOML)?;
    println!("Created {CONFIG_FILE}");

    println!();
    println!("Next steps:");
    println!();
    println!("  1. Declare dependencies in requirements.txt");
    println!();
    println!("  2. Point [launch].app at your application object:");
    println!("     app = \"app.main:app\"");
    println!();
    println!("  3. Build and run:");
    println!("     kiln build");
    println!("     kiln launch");

    Ok(())
}
