use std::io::Write;
use std::path::Path;
use std::time::Duration;

use ato_agents::command_runner::{self, OutputStream};
use ato_core::config::Config;

/// Run `command` once and return its exit code.
pub async fn run(
    config: &Config,
    command: &str,
    cwd: Option<&Path>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<i32> {
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.pipeline.command_timeout_secs));
    let grace = Duration::from_secs(config.pipeline.kill_grace_secs);

    let sink = |stream: OutputStream, chunk: &str| match stream {
        OutputStream::Stdout => {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(chunk.as_bytes());
            let _ = out.flush();
        }
        OutputStream::Stderr => {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(chunk.as_bytes());
            let _ = err.flush();
        }
    };

    let output = command_runner::run_oneshot(command, cwd, &sink, timeout, grace).await?;
    tracing::debug!(command, exit_code = output.exit_code, killed = output.killed, "exec finished");
    Ok(output.exit_code)
}
