use std::path::Path;

use anyhow::Context;
use ato_core::config::Config;

pub fn run(config: &Config, target: &Path, path_only: bool, init: bool) -> anyhow::Result<()> {
    if path_only {
        println!("{}", target.display());
        return Ok(());
    }
    if init {
        if target.exists() {
            anyhow::bail!("{} already exists", target.display());
        }
        config
            .save_to(target)
            .with_context(|| format!("failed to write {}", target.display()))?;
        println!("Wrote {}", target.display());
        return Ok(());
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
