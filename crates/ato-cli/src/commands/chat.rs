use ato_agents::prompts;
use ato_core::config::Config;
use ato_intelligence::{GenerateRequest, RequestKind};
use tokio_util::sync::CancellationToken;

pub async fn run(config: &Config, prompt: &str) -> anyhow::Result<()> {
    let gateway = super::gateway(config)?;
    let cancel = CancellationToken::new();

    let request = GenerateRequest::new(RequestKind::Chat, prompt)
        .with_system_prompt(Some(prompts::chat_system_prompt(&config.prompts)));

    let reply = tokio::select! {
        reply = gateway.generate(request, &cancel) => reply?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("interrupted");
        }
    };
    println!("{}", reply.trim_end());
    Ok(())
}
