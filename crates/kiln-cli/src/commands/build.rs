use std::path::Path;

use kiln_build::{ImageStore, build_image};
use kiln_core::KilnConfig;
use kiln_engine::EngineClient;

/// Build the project in the current directory and print the image id.
pub async fn build(tag: Option<&str>) -> anyhow::Result<()> {
    let project_dir = Path::new(".");
    let config = KilnConfig::load(project_dir)?;
    let tag = match tag {
        Some(tag) => tag.to_owned(),
        None => config.image_name(project_dir)?,
    };

    let store = ImageStore::open(&config.store_root(project_dir))?;
    let engine = EngineClient::new(config.engine.clone());

    tracing::info!(%tag, base = %config.image.base, "building image");
    let image = build_image(project_dir, &config, &engine, &store, &tag).await?;

    eprintln!("Built {} ({} layers)", image.tag, image.record.layers.len());
    println!("{}", image.id);
    Ok(())
}
