pub mod chat;
pub mod config;
pub mod diagnostics;
pub mod exec;
pub mod run;

use ato_intelligence::{provider_from_config, ModelGateway, RuntimeDiagnostics};
use ato_core::config::Config;

/// Gateway for one-off commands that run outside an orchestrator.
pub fn gateway(config: &Config) -> anyhow::Result<ModelGateway> {
    let provider = provider_from_config(&config.providers)
        .map_err(|e| anyhow::anyhow!("{e}\n  (hint: export the key or set [providers].active = \"local\")"))?;
    Ok(ModelGateway::new(
        provider,
        RuntimeDiagnostics::new(),
        config.providers.clone(),
    ))
}
