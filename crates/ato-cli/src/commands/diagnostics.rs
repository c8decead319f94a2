use ato_core::config::Config;
use serde_json::json;

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let gateway = super::gateway(config)?;

    let health = match gateway.health_check().await {
        Ok(()) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };

    let report = json!({
        "provider": gateway.provider_name(),
        "model": config.providers.model,
        "health": health,
        "runtime": gateway.diagnostics().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
