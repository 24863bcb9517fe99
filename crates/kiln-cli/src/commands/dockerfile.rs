use std::path::Path;

use kiln_build::{DockerfileGenerator, export_dockerfile};
use kiln_core::KilnConfig;

/// Print the build recipe as a Dockerfile, or write it next to kiln.toml.
pub fn dockerfile(write: bool, force: bool) -> anyhow::Result<()> {
    let project_dir = Path::new(".");
    let config = KilnConfig::load(project_dir)?;
    let content = DockerfileGenerator::new(&config).render();

    if write {
        let path = export_dockerfile(project_dir, &content, force)?;
        println!("Wrote {}", path.display());
    } else {
        print!("{content}");
    }
    Ok(())
}
