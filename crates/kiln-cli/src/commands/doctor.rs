use std::path::Path;

use kiln_core::{CONFIG_FILE, KilnConfig};
use kiln_engine::{CheckResult, EngineClient};

pub async fn doctor() -> anyhow::Result<()> {
    let project_dir = Path::new(".");
    let config_path = project_dir.join(CONFIG_FILE);

    let (config, config_check) = match KilnConfig::load(project_dir) {
        Ok(config) if config_path.exists() => (config, CheckResult::ok("Found")),
        Ok(config) => (config, CheckResult::fail("Not found, using defaults")),
        Err(e) => (KilnConfig::default(), CheckResult::fail(&format!("{e}"))),
    };

    let client = EngineClient::new(config.engine.clone());
    let mut report = client.doctor(&config).await;
    report.config_file = config_check;

    println!();
    println!("{report}");

    if !report.all_passed() {
        anyhow::bail!("some checks failed, see above for details");
    }

    Ok(())
}
