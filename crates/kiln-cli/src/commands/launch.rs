use std::path::Path;

use kiln_build::ImageStore;
use kiln_core::KilnConfig;
use kiln_launch::{Container, LaunchError, Launcher};

/// Launch a stored image and return the server's exit code.
pub async fn launch(image: Option<&str>) -> anyhow::Result<u8> {
    let project_dir = Path::new(".");
    let config = KilnConfig::load(project_dir)?;
    let image = match image {
        Some(image) => image.to_owned(),
        None => config.image_name(project_dir)?,
    };

    let store = ImageStore::open(&config.store_root(project_dir))?;
    let container = Container::create(&store, &image).map_err(LaunchError::from)?;

    let termination = Launcher::for_container(&container, &config.launch)
        .launch()
        .await?;
    Ok(termination.exit_code())
}
