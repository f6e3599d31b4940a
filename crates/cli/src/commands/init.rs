//! `cadenza init`: write a default configuration.

use cadenza_config::AppConfig;
use std::path::Path;

pub fn run(config_dir: &Path, name: &str, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_dir.join(format!("{name}.toml"));
    if path.exists() && !force {
        println!("   ⚠️  {} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }

    std::fs::create_dir_all(config_dir)?;
    std::fs::write(&path, AppConfig::default_toml())?;
    println!("   ✅ Wrote {}", path.display());
    println!("   Start with: cadenza --config {name} run");
    Ok(())
}
