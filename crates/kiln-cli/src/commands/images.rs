use std::path::Path;

use kiln_build::ImageStore;
use kiln_core::KilnConfig;
use serde::Serialize;

#[derive(Serialize)]
struct ImageSummary {
    tag: String,
    id: String,
}

fn open_store() -> anyhow::Result<ImageStore> {
    let project_dir = Path::new(".");
    let config = KilnConfig::load(project_dir)?;
    Ok(ImageStore::open(&config.store_root(project_dir))?)
}

/// List tagged images.
pub fn images(json: bool) -> anyhow::Result<()> {
    let store = open_store()?;
    let images: Vec<ImageSummary> = store
        .list()?
        .into_iter()
        .map(|(tag, id)| ImageSummary { tag, id })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&images)?);
        return Ok(());
    }

    if images.is_empty() {
        eprintln!("No images. Run `kiln build` first.");
        return Ok(());
    }
    println!("{:<24} ID", "TAG");
    for image in &images {
        println!("{:<24} {}", image.tag, image.id);
    }
    Ok(())
}

/// Print an image's configuration as JSON.
pub fn inspect(image: &str) -> anyhow::Result<()> {
    let store = open_store()?;
    let id = store.resolve(image)?;
    let record = store.load(&id)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
